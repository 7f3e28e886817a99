//! Editor authentication: argon2 password hashes and HS256 bearer tokens.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::error::{Error, Result};
use crate::store::Store;

/// Login of the built-in administrator
pub const ROOT_LOGIN: &str = "root";

/// `uid` carried by root tokens
pub const ROOT_UID: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub uid: i64,
    pub login: String,
    /// Expiry, Unix seconds
    pub exp: i64,
}

/// Hash a password with Argon2id. CPU-heavy, runs on a blocking thread.
pub async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();
    task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| Error::Internal(format!("failed to hash password: {e}")))
    })
    .await
    .map_err(|e| Error::Internal(format!("password hashing task failed: {e}")))?
}

pub async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| Error::Internal(format!("invalid password hash: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("password verification failed: {e}"))),
        }
    })
    .await
    .map_err(|e| Error::Internal(format!("password verification task failed: {e}")))?
}

pub struct Auth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: TimeDelta,
    /// Argon2 hash of the root password; root login is off without it
    root_hash: Option<String>,
}

impl Auth {
    pub fn new(secret: &str, ttl: TimeDelta, root_hash: Option<String>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            root_hash,
        }
    }

    /// Hash `ROOT_PASS` once at startup
    pub async fn with_root_password(secret: &str, ttl: TimeDelta, root_pass: Option<&str>) -> Result<Self> {
        let root_hash = match root_pass {
            Some(pass) => Some(hash_password(pass).await?),
            None => None,
        };
        Ok(Self::new(secret, ttl, root_hash))
    }

    /// Check credentials and issue a token
    pub async fn login(&self, store: &Store, login: &str, pass: &str) -> Result<String> {
        let uid = if login == ROOT_LOGIN {
            let Some(hash) = &self.root_hash else {
                warn!("Root login attempted while ROOT_PASS is unset");
                return Err(Error::InvalidCredentials);
            };
            if !verify_password(pass, hash).await? {
                return Err(Error::InvalidCredentials);
            }
            ROOT_UID
        } else {
            let editor = match store.editor(login).await {
                Ok(editor) => editor,
                Err(Error::EditorNotFound) => return Err(Error::InvalidCredentials),
                Err(e) => return Err(e),
            };
            if !verify_password(pass, &editor.pass_hash).await? {
                return Err(Error::InvalidCredentials);
            }
            editor.id
        };
        info!("Editor '{}' logged in", login);
        self.issue(uid, login)
    }

    pub fn issue(&self, uid: i64, login: &str) -> Result<String> {
        let claims = Claims {
            uid,
            login: login.to_string(),
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_password_roundtrip() {
        let hash = hash_password("hunter2").await.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2", &hash).await.unwrap());
        assert!(!verify_password("hunter3", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_root_login_claims() {
        let store = Store::in_memory().await.unwrap();
        let auth = Auth::with_root_password("secret", TimeDelta::hours(1), Some("pw"))
            .await
            .unwrap();

        assert!(matches!(
            auth.login(&store, "root", "x").await,
            Err(Error::InvalidCredentials)
        ));

        let before = Utc::now().timestamp();
        let token = auth.login(&store, "root", "pw").await.unwrap();
        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.uid, ROOT_UID);
        assert_eq!(claims.login, "root");
        assert!(claims.exp >= before + 3600 && claims.exp <= before + 3601);
    }

    #[tokio::test]
    async fn test_editor_login() {
        let store = Store::in_memory().await.unwrap();
        let hash = hash_password("letmein").await.unwrap();
        let id = store.new_editor("alice", &hash).await.unwrap();
        let auth = Auth::new("secret", TimeDelta::minutes(5), None);

        let claims = auth.verify(&auth.login(&store, "alice", "letmein").await.unwrap()).unwrap();
        assert_eq!(claims.uid, id);
        assert!(matches!(
            auth.login(&store, "bob", "letmein").await,
            Err(Error::InvalidCredentials)
        ));
        // Root is disabled without ROOT_PASS
        assert!(matches!(
            auth.login(&store, "root", "").await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[test]
    fn test_foreign_signature_is_rejected() {
        let ours = Auth::new("secret", TimeDelta::minutes(5), None);
        let theirs = Auth::new("other", TimeDelta::minutes(5), None);
        let token = theirs.issue(1, "mallory").unwrap();
        assert!(matches!(ours.verify(&token), Err(Error::Unauthorized)));
    }
}
