//! Credential checking against the `fsd_users` table.
//!
//! Supports both legacy MD5 password hashes (carried over from the
//! historic network's user database) and Argon2 hashes for accounts
//! created or re-hashed since. Dispatch is by stored-hash shape: a
//! 32-character hex string is treated as MD5, anything else is handed to
//! Argon2's PHC-string verifier.

use anyhow::Result;
use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::upsert::excluded;
use md5::{Digest, Md5};
use tracing::warn;

use crate::schema::fsd_users;

/// Capability the session engine needs from whatever is backing CID/password
/// checks, so the protocol layer can be tested without a Postgres pool - the
/// same `dyn`-dispatched seam the plugin manager uses for `FsdPlugin`.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, cid: &str, password: &str) -> Result<LoginResult>;
}

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Queryable, Debug, Clone)]
struct UserRow {
    #[allow(dead_code)]
    callsign: String,
    #[allow(dead_code)]
    cid: String,
    password_hash: String,
    rating: i32,
}

/// Outcome of a login attempt: whether the CID/password pair is valid at
/// all, and if so the rating the network has on file for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    Unauthorized,
    Authorized { rating: i32 },
}

#[derive(Clone)]
pub struct CredentialChecker {
    pool: PgPool,
}

impl CredentialChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get database connection: {}", e))
    }

    /// Verify a CID/password pair, running the blocking diesel call on a
    /// dedicated thread as the rest of this crate's repositories do.
    pub async fn login(&self, cid: &str, password: &str) -> Result<LoginResult> {
        let pool = self.pool.clone();
        let cid = cid.to_string();
        let password = password.to_string();

        tokio::task::spawn_blocking(move || -> Result<LoginResult> {
            let mut conn = pool.get()?;
            let row = fsd_users::table
                .filter(fsd_users::cid.eq(&cid))
                .select((fsd_users::callsign, fsd_users::cid, fsd_users::password_hash, fsd_users::rating))
                .first::<UserRow>(&mut conn)
                .optional()?;

            Ok(match row {
                Some(user) if verify_password(&password, &user.password_hash) => {
                    LoginResult::Authorized { rating: user.rating }
                }
                _ => LoginResult::Unauthorized,
            })
        })
        .await?
    }

    /// Create or update a user's stored credentials, always re-hashing
    /// with Argon2 regardless of what the previous hash looked like.
    pub async fn upsert_user(&self, callsign: &str, cid: &str, password: &str, rating: i32) -> Result<()> {
        let callsign = callsign.to_string();
        let cid = cid.to_string();
        let hash = hash_password_argon2(password)?;

        let mut conn = self.get_connection()?;
        diesel::insert_into(fsd_users::table)
            .values((
                fsd_users::callsign.eq(&callsign),
                fsd_users::cid.eq(&cid),
                fsd_users::password_hash.eq(&hash),
                fsd_users::rating.eq(rating),
                fsd_users::created_at.eq(Utc::now()),
                fsd_users::updated_at.eq(Utc::now()),
            ))
            .on_conflict(fsd_users::callsign)
            .do_update()
            .set((
                fsd_users::cid.eq(excluded(fsd_users::cid)),
                fsd_users::password_hash.eq(excluded(fsd_users::password_hash)),
                fsd_users::rating.eq(excluded(fsd_users::rating)),
                fsd_users::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }
}

#[async_trait]
impl Authenticator for CredentialChecker {
    async fn login(&self, cid: &str, password: &str) -> Result<LoginResult> {
        CredentialChecker::login(self, cid, password).await
    }
}

/// An MD5 digest is 32 hex characters; anything else is assumed to be an
/// Argon2 PHC string.
fn looks_like_md5(hash: &str) -> bool {
    hash.len() == 32 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    if looks_like_md5(stored_hash) {
        let mut hasher = Md5::new();
        hasher.update(password.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest.eq_ignore_ascii_case(stored_hash)
    } else {
        match PasswordHash::new(stored_hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!("stored password hash is not a valid Argon2 PHC string: {}", e);
                false
            }
        }
    }
}

fn hash_password_argon2(password: &str) -> Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use rand::rngs::OsRng;

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pool() -> Result<PgPool> {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/fsdd_test".to_string());
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder().build(manager)?;
        Ok(pool)
    }

    #[test]
    fn recognizes_md5_shape() {
        assert!(looks_like_md5("5f4dcc3b5aa765d61d8327deb882cf99"));
        assert!(!looks_like_md5("$argon2id$v=19$m=19456,t=2,p=1$abcd$efgh"));
    }

    #[test]
    fn verifies_legacy_md5_hash() {
        let mut hasher = Md5::new();
        hasher.update(b"password");
        let digest = hex::encode(hasher.finalize());
        assert!(verify_password("password", &digest));
        assert!(!verify_password("wrong", &digest));
    }

    #[test]
    fn verifies_argon2_hash_round_trip() {
        let hash = hash_password_argon2("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[tokio::test]
    async fn checker_construction_does_not_touch_the_network() {
        if let Ok(pool) = create_test_pool() {
            let _checker = CredentialChecker::new(pool);
        } else {
            println!("Skipping test - no test database connection");
        }
    }
}
