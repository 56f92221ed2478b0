use std::sync::Arc;

use crate::ark::ImageGenerator;
use crate::config::Config;
use crate::db::Database;
use crate::grants::GrantPolicy;
use crate::storage::LocalFileStorage;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub storage: LocalFileStorage,
    pub generator: Arc<dyn ImageGenerator>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Database,
        storage: LocalFileStorage,
        generator: Arc<dyn ImageGenerator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            storage,
            generator,
        }
    }

    pub fn grant_policy(&self) -> GrantPolicy {
        GrantPolicy {
            ttl_seconds: self.config.grant_ttl_seconds,
            max_downloads: self.config.grant_max_downloads,
        }
    }
}
