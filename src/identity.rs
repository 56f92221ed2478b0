use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use time::Duration as CookieDuration;
use uuid::Uuid;

use crate::db::Database;

pub const IDENTITY_COOKIE: &str = "user_id";
const MIN_TOKEN_LEN: usize = 10;
const COOKIE_MAX_AGE_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    /// Present when a token was minted and the client has to store it.
    pub new_token: Option<String>,
}

/// Maps an inbound token (if any) to an identity. Tokens shorter than the
/// minimum length are treated as absent.
pub fn resolve_identity(inbound: Option<&str>) -> Identity {
    match inbound.map(str::trim) {
        Some(token) if token.len() >= MIN_TOKEN_LEN => Identity {
            user_id: token.to_string(),
            new_token: None,
        },
        _ => {
            let token = Uuid::new_v4().to_string();
            Identity {
                user_id: token.clone(),
                new_token: Some(token),
            }
        }
    }
}

pub fn identity_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((IDENTITY_COOKIE, token))
        .path("/")
        .max_age(CookieDuration::days(COOKIE_MAX_AGE_DAYS))
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .build()
}

/// Resolves the caller from its cookie jar, registers it and returns the
/// jar to send back (with a fresh cookie when one was minted).
pub async fn identify(
    db: &Database,
    jar: CookieJar,
    secure_cookie: bool,
) -> anyhow::Result<(Identity, CookieJar)> {
    let identity = resolve_identity(jar.get(IDENTITY_COOKIE).map(|cookie| cookie.value()));
    db.register_identity(&identity.user_id, Utc::now().timestamp())
        .await?;
    let jar = match identity.new_token.clone() {
        Some(token) => jar.add(identity_cookie(token, secure_cookie)),
        None => jar,
    };
    Ok((identity, jar))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;

    #[test]
    fn reuses_long_enough_tokens() {
        let identity = resolve_identity(Some("abcdefghij"));
        assert_eq!(identity.user_id, "abcdefghij");
        assert!(identity.new_token.is_none());
    }

    #[test]
    fn mints_for_missing_or_short_tokens() {
        for inbound in [None, Some(""), Some("short")] {
            let identity = resolve_identity(inbound);
            assert_eq!(identity.new_token.as_deref(), Some(identity.user_id.as_str()));
            assert!(identity.user_id.len() >= MIN_TOKEN_LEN);
        }
        assert_ne!(resolve_identity(None).user_id, resolve_identity(None).user_id);
    }

    #[test]
    fn cookie_is_long_lived_and_http_only() {
        let cookie = identity_cookie("token-value-1".to_string(), true);
        assert_eq!(cookie.name(), IDENTITY_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(CookieDuration::days(365)));
    }

    #[tokio::test]
    async fn identify_registers_and_sets_cookie_once() {
        let (_dir, db) = test_db().await;
        let (identity, jar) = identify(&db, CookieJar::new(), false).await.unwrap();
        let token = jar.get(IDENTITY_COOKIE).unwrap().value().to_string();
        assert_eq!(token, identity.user_id);
        assert!(db.identity_created_at(&token).await.unwrap().is_some());

        let returning = CookieJar::new().add(Cookie::new(IDENTITY_COOKIE, token.clone()));
        let (again, _) = identify(&db, returning, false).await.unwrap();
        assert_eq!(again.user_id, token);
        assert!(again.new_token.is_none());
    }
}
