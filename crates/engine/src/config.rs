//! Engine and server configuration.
//!
//! Loaded from a TOML file; every key is optional and falls back to the
//! defaults below. A few settings can also come from the environment so
//! that secrets stay out of the file.

use std::path::Path;

use jitgate_storage::ActionKind;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::Duration;

/// HMAC key for agent pseudonyms in the audit log.
pub const SECRET_KEY_ENV: &str = "JITGATE_SECRET_KEY";
/// Shared key the upstream gateway presents on every `/api` request.
pub const API_KEY_ENV: &str = "JITGATE_API_KEY";
/// Requests per minute per client IP.
pub const RATE_LIMIT_ENV: &str = "JITGATE_RATE_LIMIT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    pub verification: VerificationConfig,
    pub privilege: PrivilegeConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationConfig {
    /// Owners at or above this score cannot be verified by an agent.
    pub risk_threshold: i64,
    pub max_sessions_per_day: u64,
    pub session_ttl_secs: i64,
    pub max_attempts: u32,
    /// Added to the owner's risk score when a session locks out.
    pub lockout_risk_penalty: i64,
    pub verify_base_url: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            risk_threshold: 80,
            max_sessions_per_day: 200,
            session_ttl_secs: 15 * 60,
            max_attempts: 3,
            lockout_risk_penalty: 10,
            verify_base_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrivilegeConfig {
    /// What a passed verification grants the assigned agent.
    pub grant_action: ActionKind,
    pub grant_ttl_secs: i64,
    /// Lifetime of the owner-bound token minted by a reset-link redemption.
    pub reset_token_ttl_secs: i64,
    pub reset_base_url: String,
    pub min_password_len: usize,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            grant_action: ActionKind::SendResetLink,
            grant_ttl_secs: 5 * 60,
            reset_token_ttl_secs: 15 * 60,
            reset_base_url: "http://localhost:3000".to_string(),
            min_password_len: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// Attempts per audit row before a decision is reported as a system error.
    pub write_retries: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { write_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    /// Requests per minute per client IP.
    pub rate_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            rate_limit: 60,
        }
    }
}

impl GateConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: GateConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.verification;
        if v.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "verification.max_attempts must be at least 1".to_string(),
            ));
        }
        if v.session_ttl_secs <= 0 {
            return Err(ConfigError::Invalid(
                "verification.session_ttl_secs must be positive".to_string(),
            ));
        }
        if v.lockout_risk_penalty < 0 {
            return Err(ConfigError::Invalid(
                "verification.lockout_risk_penalty must not be negative".to_string(),
            ));
        }
        let p = &self.privilege;
        if p.grant_ttl_secs <= 0 || p.reset_token_ttl_secs <= 0 {
            return Err(ConfigError::Invalid(
                "privilege lifetimes must be positive".to_string(),
            ));
        }
        if self.audit.write_retries == 0 {
            return Err(ConfigError::Invalid(
                "audit.write_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `JITGATE_RATE_LIMIT` if set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var(RATE_LIMIT_ENV) {
            self.server.rate_limit = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{RATE_LIMIT_ENV} must be an integer, got {raw:?}"))
            })?;
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.verification.session_ttl_secs)
    }

    pub fn grant_ttl(&self) -> Duration {
        Duration::seconds(self.privilege.grant_ttl_secs)
    }

    pub fn reset_token_ttl(&self) -> Duration {
        Duration::seconds(self.privilege.reset_token_ttl_secs)
    }
}

/// The audit pseudonym key: `JITGATE_SECRET_KEY` when set, otherwise a
/// random per-process key. Pseudonyms from a random key cannot be
/// correlated across restarts.
pub fn resolve_secret_key() -> Vec<u8> {
    match std::env::var(SECRET_KEY_ENV) {
        Ok(key) if !key.is_empty() => key.into_bytes(),
        _ => {
            tracing::warn!(
                "{SECRET_KEY_ENV} is not set; audit pseudonyms use a random per-process key"
            );
            let mut key = vec![0u8; 32];
            OsRng.fill_bytes(&mut key);
            key
        }
    }
}
