use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};

use crate::config::Config;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub bg_color: String,
    pub preview_key: String,
    pub hd_key: String,
    pub mime_type: String,
    pub meta: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemCode {
    pub code_hash: String,
    pub code_hint: String,
    pub total_uses: i64,
    pub used_uses: i64,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub note: String,
}

impl RedeemCode {
    pub fn remaining_uses(&self) -> i64 {
        (self.total_uses - self.used_uses).max(0)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub grant_id: String,
    pub user_id: String,
    pub asset_id: String,
    pub kind: String,
    pub expires_at: i64,
    pub max_downloads: i64,
    pub download_count: i64,
    /// Set when the last allowed download is counted.
    pub used_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub event: String,
    pub meta: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputToken {
    pub asset_id: String,
    pub token: String,
    pub input_key: String,
    pub expires_at: i64,
    pub created_at: i64,
}

/// The only mutations allowed on ledger rows. Each runs as one atomic
/// `UPDATE ... WHERE <predicate> RETURNING <counter>`.
#[derive(Debug, Clone, Copy)]
pub enum ConditionalUpdate<'a> {
    /// Take one use if the code exists, has not expired and has uses left.
    ConsumeCodeUse { code_hash: &'a str, now: i64 },
    /// Count one download if the grant belongs to the identity, has not
    /// expired and is below its quota.
    CountDownload {
        grant_id: &'a str,
        user_id: &'a str,
        now: i64,
    },
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self> {
        Self::connect(&config.db_path, config.store_timeout).await
    }

    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db directory {:?}", parent))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .context("connect to sqlite")?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = r#"
        CREATE TABLE IF NOT EXISTS users (
          user_id TEXT PRIMARY KEY,
          created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS id_assets (
          asset_id TEXT PRIMARY KEY,
          created_at INTEGER NOT NULL,
          bg_color TEXT NOT NULL,
          preview_key TEXT NOT NULL,
          hd_key TEXT NOT NULL,
          mime_type TEXT NOT NULL,
          meta TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS redeem_codes (
          code_hash TEXT PRIMARY KEY,
          code_hint TEXT NOT NULL,
          total_uses INTEGER NOT NULL,
          used_uses INTEGER NOT NULL DEFAULT 0,
          expires_at INTEGER,
          created_at INTEGER NOT NULL,
          note TEXT NOT NULL DEFAULT '',
          CHECK (used_uses >= 0 AND used_uses <= total_uses)
        );
        CREATE TABLE IF NOT EXISTS grants (
          grant_id TEXT PRIMARY KEY,
          user_id TEXT NOT NULL,
          asset_id TEXT NOT NULL,
          kind TEXT NOT NULL,
          expires_at INTEGER NOT NULL,
          max_downloads INTEGER NOT NULL,
          download_count INTEGER NOT NULL DEFAULT 0,
          used_at INTEGER,
          created_at INTEGER NOT NULL,
          CHECK (download_count >= 0 AND download_count <= max_downloads)
        );
        CREATE INDEX IF NOT EXISTS grants_user_idx ON grants(user_id);
        CREATE TABLE IF NOT EXISTS logs (
          id TEXT PRIMARY KEY,
          user_id TEXT,
          event TEXT NOT NULL,
          meta TEXT NOT NULL,
          created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS logs_event_idx ON logs(event, created_at);
        CREATE TABLE IF NOT EXISTS id_inputs (
          asset_id TEXT PRIMARY KEY,
          token TEXT NOT NULL,
          input_key TEXT NOT NULL,
          expires_at INTEGER NOT NULL,
          created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS id_inputs_expires_idx ON id_inputs(expires_at);
        "#;
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .context("initialize schema")?;
        Ok(())
    }

    /// Returns `true` when the identity was not known before.
    pub async fn register_identity(&self, user_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO users (user_id, created_at) VALUES (?1, ?2)")
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Writes the asset row and its audit entry together; the asset becomes
    /// visible only once both are committed.
    pub async fn insert_asset(&self, asset: &Asset, audit: &AuditEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO id_assets (asset_id, created_at, bg_color, preview_key, hd_key, mime_type, meta)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&asset.asset_id)
        .bind(asset.created_at)
        .bind(&asset.bg_color)
        .bind(&asset.preview_key)
        .bind(&asset.hd_key)
        .bind(&asset.mime_type)
        .bind(&asset.meta)
        .execute(&mut *tx)
        .await?;
        insert_audit(&mut *tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        let row = sqlx::query(
            r#"
            SELECT asset_id, created_at, bg_color, preview_key, hd_key, mime_type, meta
            FROM id_assets
            WHERE asset_id = ?1
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Asset {
            asset_id: row.get("asset_id"),
            bg_color: row.get("bg_color"),
            preview_key: row.get("preview_key"),
            hd_key: row.get("hd_key"),
            mime_type: row.get("mime_type"),
            meta: row.get("meta"),
            created_at: row.get("created_at"),
        }))
    }

    pub async fn put_input_token(&self, token: &InputToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO id_inputs (asset_id, token, input_key, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&token.asset_id)
        .bind(&token.token)
        .bind(&token.input_key)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_input_token(&self, asset_id: &str) -> Result<Option<InputToken>> {
        let row = sqlx::query(
            r#"
            SELECT asset_id, token, input_key, expires_at, created_at
            FROM id_inputs
            WHERE asset_id = ?1
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| InputToken {
            asset_id: row.get("asset_id"),
            token: row.get("token"),
            input_key: row.get("input_key"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
        }))
    }

    /// Inserts codes in one transaction. Returns the positions of codes whose
    /// hash already existed and were therefore skipped.
    pub async fn insert_redeem_codes(&self, codes: &[RedeemCode]) -> Result<Vec<usize>> {
        let mut skipped = Vec::new();
        let mut tx = self.pool.begin().await?;
        for (index, code) in codes.iter().enumerate() {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO redeem_codes (
                  code_hash, code_hint, total_uses, used_uses, expires_at, created_at, note
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&code.code_hash)
            .bind(&code.code_hint)
            .bind(code.total_uses)
            .bind(code.used_uses)
            .bind(code.expires_at)
            .bind(code.created_at)
            .bind(&code.note)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                skipped.push(index);
            }
        }
        tx.commit().await?;
        Ok(skipped)
    }

    pub async fn find_redeem_code(&self, code_hash: &str) -> Result<Option<RedeemCode>> {
        let row = sqlx::query(
            r#"
            SELECT code_hash, code_hint, total_uses, used_uses, expires_at, created_at, note
            FROM redeem_codes
            WHERE code_hash = ?1
            "#,
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| RedeemCode {
            code_hash: row.get("code_hash"),
            code_hint: row.get("code_hint"),
            total_uses: row.get("total_uses"),
            used_uses: row.get("used_uses"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
            note: row.get("note"),
        }))
    }

    /// Compare-and-swap over a single ledger row. Returns the row's counter
    /// after the update (`used_uses` or `download_count`), or `None` when the
    /// predicate did not hold.
    pub async fn conditional_update(&self, update: ConditionalUpdate<'_>) -> Result<Option<i64>> {
        let counter = match update {
            ConditionalUpdate::ConsumeCodeUse { code_hash, now } => {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    UPDATE redeem_codes
                    SET used_uses = used_uses + 1
                    WHERE code_hash = ?1
                      AND (expires_at IS NULL OR expires_at > ?2)
                      AND used_uses < total_uses
                    RETURNING used_uses
                    "#,
                )
                .bind(code_hash)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
            ConditionalUpdate::CountDownload {
                grant_id,
                user_id,
                now,
            } => {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    UPDATE grants
                    SET download_count = download_count + 1,
                        used_at = CASE
                          WHEN download_count + 1 >= max_downloads THEN ?3
                          ELSE used_at
                        END
                    WHERE grant_id = ?1
                      AND user_id = ?2
                      AND expires_at > ?3
                      AND download_count < max_downloads
                    RETURNING download_count
                    "#,
                )
                .bind(grant_id)
                .bind(user_id)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(counter)
    }

    pub async fn insert_grant(&self, grant: &Grant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO grants (
              grant_id, user_id, asset_id, kind, expires_at, max_downloads,
              download_count, used_at, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&grant.grant_id)
        .bind(&grant.user_id)
        .bind(&grant.asset_id)
        .bind(&grant.kind)
        .bind(grant.expires_at)
        .bind(grant.max_downloads)
        .bind(grant.download_count)
        .bind(grant.used_at)
        .bind(grant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Looks a grant up only within the identity that owns it.
    pub async fn find_grant(&self, grant_id: &str, user_id: &str) -> Result<Option<Grant>> {
        let row = sqlx::query(
            r#"
            SELECT grant_id, user_id, asset_id, kind, expires_at, max_downloads,
                   download_count, used_at, created_at
            FROM grants
            WHERE grant_id = ?1 AND user_id = ?2
            "#,
        )
        .bind(grant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(grant_from_row))
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut *conn, entry).await
    }
}

#[cfg(test)]
impl Database {
    pub async fn identity_created_at(&self, user_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT created_at FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("created_at")))
    }

    pub async fn list_audit(&self, event: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, event, meta, created_at
            FROM logs
            WHERE event = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                user_id: row.get("user_id"),
                event: row.get("event"),
                meta: row.get("meta"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

async fn insert_audit(conn: &mut sqlx::SqliteConnection, entry: &AuditEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO logs (id, user_id, event, meta, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.user_id)
    .bind(&entry.event)
    .bind(&entry.meta)
    .bind(entry.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn grant_from_row(row: SqliteRow) -> Grant {
    Grant {
        grant_id: row.get("grant_id"),
        user_id: row.get("user_id"),
        asset_id: row.get("asset_id"),
        kind: row.get("kind"),
        expires_at: row.get("expires_at"),
        max_downloads: row.get("max_downloads"),
        download_count: row.get("download_count"),
        used_at: row.get("used_at"),
        created_at: row.get("created_at"),
    }
}
