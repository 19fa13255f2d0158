//! Salted one-way credential hashing behind a small trait, so the seeder and
//! the auth handlers do not depend on a concrete algorithm.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("failed to hash password: {0}")]
    Hashing(String),

    #[error("invalid password hash format: {0}")]
    InvalidHash(String),

    #[error("password verification failed: {0}")]
    Verification(String),
}

/**
 * \brief 凭据哈希接口：加盐哈希、校验、结构检查。
 */
pub trait CredentialHasher: Send + Sync {
    /** \brief 为明文生成带盐哈希串。 */
    fn hash(&self, plaintext: &str) -> Result<String, PasswordError>;

    /**
     * \brief 校验明文与哈希是否匹配。
     * \details 不匹配返回 `Ok(false)`；哈希串本身无法解析时返回错误。
     */
    fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, PasswordError>;

    /** \brief 哈希串能否按本算法的格式解析。 */
    fn is_well_formed(&self, hash: &str) -> bool;
}

/**
 * \brief 基于 Argon2id 的默认实现，输出 PHC 格式字符串。
 */
#[derive(Debug, Default, Clone)]
pub struct Argon2Hasher;

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, plaintext: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| PasswordError::Hashing(e.to_string()))
    }

    fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, PasswordError> {
        let parsed = PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHash(e.to_string()))?;
        match Argon2::default().verify_password(plaintext.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(PasswordError::Verification(e.to_string())),
        }
    }

    fn is_well_formed(&self, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => parsed.algorithm.as_str().starts_with("argon2") && parsed.hash.is_some(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = Argon2Hasher;
        let hash = hasher.hash("admin123").expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("admin123", &hash).expect("verify"));
        assert!(!hasher.verify("wrong-password", &hash).expect("verify"));
    }

    #[test]
    fn test_hashes_are_salted() {
        let hasher = Argon2Hasher;
        let a = hasher.hash("same").unwrap();
        let b = hasher.hash("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_hash() {
        let hasher = Argon2Hasher;
        assert!(!hasher.is_well_formed("not-a-hash"));
        assert!(!hasher.is_well_formed(""));
        // legacy bcrypt-style value left behind by an old seed migration
        assert!(!hasher.is_well_formed(
            "$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy"
        ));
        assert!(hasher.verify("admin123", "not-a-hash").is_err());

        let good = hasher.hash("x").unwrap();
        assert!(hasher.is_well_formed(&good));
    }
}
