//! The signed-in operator: process-wide state with explicit lifecycle.
//!
//! [`Operator::load`] restores the previous sign-in at startup,
//! [`Operator::sign_in`] persists it, [`Operator::sign_out`] clears memory
//! and deletes the file.

use crate::store::Store;
use rollcall_core::User;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("store error: {0}")]
    Store(#[from] rollcall_core::collab::StoreError),
    #[error("operator file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("operator file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub struct Operator {
    path: PathBuf,
    current: RwLock<Option<User>>,
}

impl Operator {
    /// Restore the operator saved at `path`, if any.
    ///
    /// A corrupt file is discarded rather than blocking startup.
    pub fn load(path: &Path) -> Self {
        let current = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<User>(&bytes) {
                Ok(user) => {
                    tracing::info!(user = %user.id, "restored signed-in operator");
                    Some(user)
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "discarding corrupt operator file"
                    );
                    let _ = std::fs::remove_file(path);
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            path: path.to_path_buf(),
            current: RwLock::new(current),
        }
    }

    pub fn current(&self) -> Option<User> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Verify credentials against the store and remember the user.
    pub fn sign_in(
        &self,
        store: &Store,
        email: &str,
        password: &str,
    ) -> Result<User, OperatorError> {
        let (user, stored_hash) = store
            .find_user_by_email(email)?
            .ok_or(OperatorError::InvalidCredentials)?;

        let Some(stored_hash) = stored_hash else {
            return Err(OperatorError::InvalidCredentials);
        };
        if !stored_hash.eq_ignore_ascii_case(&hash_password(password)) {
            return Err(OperatorError::InvalidCredentials);
        }

        self.persist(&user)?;
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(user.clone());
        tracing::info!(user = %user.id, role = user.role.as_str(), "operator signed in");
        Ok(user)
    }

    pub fn sign_out(&self) -> Result<(), OperatorError> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(OperatorError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        if let Some(user) = previous {
            tracing::info!(user = %user.id, "operator signed out");
        }
        Ok(())
    }

    fn persist(&self, user: &User) -> Result<(), OperatorError> {
        let io_err = |source| OperatorError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(user)?;
        std::fs::write(&self.path, json).map_err(io_err)
    }
}

/// Lowercase hex SHA-256 of the password, as stored in `users.password_hash`.
pub fn hash_password(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
