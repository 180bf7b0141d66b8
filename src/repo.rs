use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("internal: {0}")]
    Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

/// Credential store. Email uniqueness is enforced here, before insert.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Persists a new user; `Conflict` when the email is already taken.
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn find_by_email(&self, email: &str) -> RepoResult<User>;
    async fn find_by_id(&self, id: Id) -> RepoResult<User>;
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/users.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        next_id: Id,
    }

    /// In-memory user store with a JSON snapshot, for dev and tests.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            match std::env::var("BULLIONX_DATA_DIR") {
                Ok(dir) => {
                    let mut p = PathBuf::from(dir);
                    p.push("users.json");
                    p
                }
                Err(_) => PathBuf::from(SNAPSHOT_PATH),
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        log::info!("loaded user snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        // losing the snapshot means losing every credential
                        log::error!(
                            "failed to parse snapshot '{}': {e}; starting empty",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(bytes) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, bytes) {
                    log::error!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let mut s = self.state.write().unwrap();
            // uniqueness check before insert; emails compared as given
            if s.users.values().any(|u| u.email == new.email) {
                return Err(RepoError::Conflict);
            }
            s.next_id += 1;
            let user = User {
                id: s.next_id,
                first_name: new.first_name,
                last_name: new.last_name,
                email: new.email,
                password_hash: new.password_hash,
                email_verified: false,
                created_at: Utc::now(),
            };
            s.users.insert(user.id, user.clone());
            drop(s); // release lock before persisting
            self.persist();
            Ok(user)
        }

        async fn find_by_email(&self, email: &str) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users
                .values()
                .find(|u| u.email == email)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn find_by_id(&self, id: Id) -> RepoResult<User> {
            let s = self.state.read().unwrap();
            s.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }
    }

    const USER_COLUMNS: &str =
        "id, first_name, last_name, email, password_hash, email_verified, created_at";

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: NewUser) -> RepoResult<User> {
            let rec = sqlx::query_as::<_, User>(&format!(
                "INSERT INTO users (first_name, last_name, email, password_hash) \
                 VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
            ))
            .bind(&new.first_name)
            .bind(&new.last_name)
            .bind(&new.email)
            .bind(&new.password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                // unique_violation on the email constraint
                sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                    RepoError::Conflict
                }
                other => RepoError::Internal(other.to_string()),
            })?;
            Ok(rec)
        }

        async fn find_by_email(&self, email: &str) -> RepoResult<User> {
            sqlx::query_as::<_, User>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
            ))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepoError::Internal(e.to_string()))?
            .ok_or(RepoError::NotFound)
        }

        async fn find_by_id(&self, id: Id) -> RepoResult<User> {
            sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| RepoError::Internal(e.to_string()))?
                .ok_or(RepoError::NotFound)
        }
    }
}
