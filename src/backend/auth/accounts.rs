//! Account Operations
//!
//! Registration, login and password maintenance on top of the store's
//! session contract. The HTTP surface for these lives outside the
//! core; these functions are the complete server-side behavior.

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Duration;

use crate::backend::auth::sessions::random_token;
use crate::backend::db::{Result, Store};
use crate::shared::config::{MAX_LEN_PASSWORD, MAX_LEN_USER_ID};
use crate::shared::ProtocolError;

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() || user_id.len() > MAX_LEN_USER_ID {
        return Err(ProtocolError::invalid_payload("login ID").into());
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() || password.len() > MAX_LEN_PASSWORD {
        return Err(ProtocolError::invalid_payload("password").into());
    }
    Ok(())
}

/// Register a new account and open a session for it. Returns the
/// session token.
pub async fn register(
    store: &dyn Store,
    user_id: &str,
    password: &str,
    session_expiry_days: i64,
) -> Result<String> {
    validate_user_id(user_id)?;
    validate_password(password)?;

    let password_hash = hash(password, DEFAULT_COST)?;
    store.register_account(user_id, &password_hash).await?;
    commit_login(store, user_id, session_expiry_days).await
}

/// Log into a registered account. Returns the session token.
pub async fn login(
    store: &dyn Store,
    user_id: &str,
    password: &str,
    session_expiry_days: i64,
) -> Result<String> {
    validate_user_id(user_id)?;

    let hash = store
        .get_password(user_id)
        .await?
        .ok_or(ProtocolError::InvalidCreds)?;
    if !verify(password, &hash)? {
        return Err(ProtocolError::InvalidCreds.into());
    }
    commit_login(store, user_id, session_expiry_days).await
}

/// Change the account password, verifying the old one first
pub async fn change_password(
    store: &dyn Store,
    user_id: &str,
    old_password: &str,
    new_password: &str,
) -> Result<()> {
    validate_password(new_password)?;

    let hash_stored = store
        .get_password(user_id)
        .await?
        .ok_or(ProtocolError::InvalidCreds)?;
    if !verify(old_password, &hash_stored)? {
        return Err(ProtocolError::InvalidCreds.into());
    }
    let new_hash = hash(new_password, DEFAULT_COST)?;
    store.change_password(user_id, &new_hash).await
}

async fn commit_login(store: &dyn Store, user_id: &str, session_expiry_days: i64) -> Result<String> {
    let token = random_token();
    store
        .write_login_session(user_id, &token, Duration::days(session_expiry_days))
        .await?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::db::MemStore;

    #[tokio::test]
    async fn test_register_and_login() {
        let store = MemStore::new();
        let token = register(&store, "admin", "hunter2", 30).await.unwrap();
        assert!(store.is_logged_in("admin", &token).await.unwrap());

        let second = login(&store, "admin", "hunter2", 30).await.unwrap();
        assert_ne!(token, second);
        assert!(store.is_logged_in("admin", &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let store = MemStore::new();
        register(&store, "admin", "hunter2", 30).await.unwrap();

        let err = login(&store, "admin", "wrong", 30).await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::InvalidCreds)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_user_id_rejected() {
        let store = MemStore::new();
        register(&store, "admin", "hunter2", 30).await.unwrap();
        assert!(register(&store, "admin", "other", 30).await.is_err());
    }

    #[tokio::test]
    async fn test_change_password_invalidates_old() {
        let store = MemStore::new();
        register(&store, "admin", "hunter2", 30).await.unwrap();
        change_password(&store, "admin", "hunter2", "correct horse")
            .await
            .unwrap();

        assert!(login(&store, "admin", "hunter2", 30).await.is_err());
        assert!(login(&store, "admin", "correct horse", 30).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_user_id_rejected() {
        let store = MemStore::new();
        let long = "a".repeat(MAX_LEN_USER_ID + 1);
        assert!(register(&store, &long, "hunter2", 30).await.is_err());
    }
}
