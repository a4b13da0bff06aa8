use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version, ARGON2ID_IDENT,
};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::error;

/// Argon2id memory cost in KiB.
pub const HASH_MEMORY_KIB: u32 = 19 * 1024;
/// Argon2id pass count.
pub const HASH_ITERATIONS: u32 = 2;
/// Argon2id lanes.
pub const HASH_PARALLELISM: u32 = 1;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password must not be empty")]
    EmptyInput,
    #[error("stored password hash is malformed")]
    MalformedHash,
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Salted argon2id hashing with a fixed cost.
#[derive(Clone)]
pub struct CredentialHasher {
    argon2: Argon2<'static>,
}

impl CredentialHasher {
    pub fn new() -> Result<Self, PasswordError> {
        let params = Params::new(HASH_MEMORY_KIB, HASH_ITERATIONS, HASH_PARALLELISM, None)
            .map_err(|e| PasswordError::Hash(e.to_string()))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a plaintext into a PHC string. Each call draws a fresh salt.
    pub fn hash(&self, plain: &str) -> Result<String, PasswordError> {
        if plain.is_empty() {
            return Err(PasswordError::EmptyInput);
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                PasswordError::Hash(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    /// Returns `Ok(false)` on mismatch; errors only when the stored hash cannot be parsed
    /// or was produced by an unsupported algorithm.
    pub fn verify(&self, hash: &str, plain: &str) -> Result<bool, PasswordError> {
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            PasswordError::MalformedHash
        })?;
        match self.argon2.verify_password(plain.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => {
                error!(error = %e, "argon2 verify_password error");
                Err(PasswordError::MalformedHash)
            }
        }
    }
}

/// True when `hash` is an argon2id PHC string, the only format the directory stores.
pub fn is_supported_hash(hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| parsed.algorithm == ARGON2ID_IDENT && parsed.hash.is_some())
        .unwrap_or(false)
}
