//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, known networks and levels)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AccepterConfig → Result<(), Vec<ValidationError>>

use crate::config::schema::AccepterConfig;

const NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6", "unix"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener.address must not be empty")]
    EmptyAddress,

    #[error("listener.network {0:?} is not one of tcp, tcp4, tcp6, unix")]
    UnsupportedNetwork(String),

    #[error("listener.tls.{0} must not be empty")]
    EmptyTlsPath(&'static str),

    #[error("shutdown.drain_timeout_secs must be greater than zero")]
    ZeroDrainTimeout,

    #[error("observability.log_level {0:?} is not a valid level")]
    InvalidLogLevel(String),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &AccepterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.address.trim().is_empty() {
        errors.push(ValidationError::EmptyAddress);
    }
    if !NETWORKS.contains(&listener.network.as_str()) {
        errors.push(ValidationError::UnsupportedNetwork(listener.network.clone()));
    }
    if let Some(tls) = &listener.tls {
        if tls.cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("cert_path"));
        }
        if tls.key_path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("key_path"));
        }
    }

    if config.shutdown.drain_timeout_secs == 0 {
        errors.push(ValidationError::ZeroDrainTimeout);
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::InvalidLogLevel(
            config.observability.log_level.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::CertificateConfig;
    use std::path::PathBuf;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&AccepterConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = AccepterConfig::default();
        config.listener.address = " ".into();
        config.listener.network = "udp".into();
        config.listener.tls = Some(CertificateConfig {
            cert_path: PathBuf::new(),
            key_path: PathBuf::from("key.pem"),
        });
        config.shutdown.drain_timeout_secs = 0;
        config.observability.log_level = "loud".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::EmptyAddress,
                ValidationError::UnsupportedNetwork("udp".into()),
                ValidationError::EmptyTlsPath("cert_path"),
                ValidationError::ZeroDrainTimeout,
                ValidationError::InvalidLogLevel("loud".into()),
            ]
        );
    }

    #[test]
    fn log_level_is_case_insensitive() {
        let mut config = AccepterConfig::default();
        config.observability.log_level = "DEBUG".into();
        assert!(validate_config(&config).is_ok());
    }
}
