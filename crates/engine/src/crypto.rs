//! Tokens, salted digests and audit pseudonyms.
//!
//! Digest format: `sha256$<salt, base64url>$<hex sha256(salt || secret)>`.
//! Challenge answers are trimmed and lowercased before hashing; passwords
//! are hashed as given.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use jitgate_storage::UserId;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::GateError;

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "sha256";
const SALT_LEN: usize = 16;
const TOKEN_LEN: usize = 32;
const TEMP_PASSWORD_LEN: usize = 12;

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// An unguessable opaque identifier (session ids, privilege tokens).
pub fn generate_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<TOKEN_LEN>())
}

/// A one-time password handed to the agent by a direct reset.
pub fn temporary_password() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<TEMP_PASSWORD_LEN>())
}

fn normalize_answer(answer: &str) -> String {
    answer.trim().to_lowercase()
}

fn salted_hex(salt: &[u8], secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hex::encode(hasher.finalize())
}

fn digest(secret: &[u8]) -> String {
    let salt = random_bytes::<SALT_LEN>();
    format!(
        "{SCHEME}${}${}",
        URL_SAFE_NO_PAD.encode(salt),
        salted_hex(&salt, secret)
    )
}

fn verify(stored: &str, secret: &[u8]) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(scheme), Some(salt), Some(expected)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if scheme != SCHEME {
        return false;
    }
    let Ok(salt) = URL_SAFE_NO_PAD.decode(salt) else {
        return false;
    };
    let actual = salted_hex(&salt, secret);
    actual.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub fn hash_answer(answer: &str) -> String {
    digest(normalize_answer(answer).as_bytes())
}

pub fn verify_answer(stored: &str, answer: &str) -> bool {
    verify(stored, normalize_answer(answer).as_bytes())
}

pub fn hash_password(password: &str) -> String {
    digest(password.as_bytes())
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    verify(stored, password.as_bytes())
}

/// Keyed one-way pseudonyms for agent identities.
#[derive(Clone)]
pub struct Pseudonymizer {
    key: Vec<u8>,
}

impl std::fmt::Debug for Pseudonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pseudonymizer").finish_non_exhaustive()
    }
}

impl Pseudonymizer {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// `hex(HMAC-SHA256(key, "CS-ID-<id>"))`. Stable for a given key.
    pub fn agent_ref(&self, agent_id: UserId) -> Result<String, GateError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| GateError::System(format!("pseudonym key: {e}")))?;
        mac.update(format!("CS-ID-{agent_id}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
