// src/hash.rs
use std::num::NonZeroU32;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

static ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
const DEFAULT_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;

/// PBKDF2 password hashing. Hashes are stored as
/// `<iterations>$<base64 salt>$<base64 hash>`, so the cost can change without
/// invalidating existing users.
#[derive(Clone)]
pub struct PasswordHasher {
    rng: SystemRandom,
    iterations: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        PasswordHasher::new()
    }
}

impl PasswordHasher {
    pub fn new() -> Self {
        PasswordHasher::with_iterations(DEFAULT_ITERATIONS)
    }

    pub fn with_iterations(iterations: u32) -> Self {
        PasswordHasher {
            rng: SystemRandom::new(),
            iterations,
        }
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        let iterations = NonZeroU32::new(self.iterations).ok_or_else(|| anyhow!("Iteration count must be positive"))?;
        let mut salt = [0u8; SALT_LEN];
        self.rng
            .fill(&mut salt)
            .map_err(|e| anyhow!("Failed to generate salt: {}", e))?;

        let mut hash = [0u8; HASH_LEN];
        pbkdf2::derive(ALGORITHM, iterations, &salt, password.as_bytes(), &mut hash);

        Ok(format!("{}${}${}", iterations, STANDARD.encode(salt), STANDARD.encode(hash)))
    }

    /// False for a wrong password and for a malformed stored hash alike.
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        match parse(stored) {
            Ok((iterations, salt, hash)) => {
                pbkdf2::verify(ALGORITHM, iterations, &salt, password.as_bytes(), &hash).is_ok()
            }
            Err(e) => {
                log::warn!("Unreadable password hash: {}", e);
                false
            }
        }
    }
}

fn parse(stored: &str) -> Result<(NonZeroU32, Vec<u8>, Vec<u8>)> {
    let mut parts = stored.splitn(3, '$');
    let (Some(iterations), Some(salt), Some(hash)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("Expected three '$'-separated fields"));
    };
    let iterations: u32 = iterations.parse()?;
    let iterations = NonZeroU32::new(iterations).ok_or_else(|| anyhow!("Zero iteration count"))?;
    let salt = STANDARD.decode(salt).map_err(|e| anyhow!("Base64 decode error: {}", e))?;
    let hash = STANDARD.decode(hash).map_err(|e| anyhow!("Base64 decode error: {}", e))?;
    Ok((iterations, salt, hash))
}
