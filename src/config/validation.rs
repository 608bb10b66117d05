//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Serde handles shape and types; this covers value ranges
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{AppConfig, BaseConfig};

/// A single semantic problem in the loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn validate_base(config: &BaseConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.metrics.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "metrics.bind_address",
            format!("'{}' is not a socket address", config.metrics.bind_address),
        ));
    }

    let buckets = &config.metrics.histogram_buckets;
    if buckets.is_empty() {
        errors.push(ValidationError::new(
            "metrics.histogram_buckets",
            "at least one bucket is required",
        ));
    } else if buckets.iter().any(|b| !b.is_finite())
        || buckets.windows(2).any(|w| w[0] >= w[1])
    {
        errors.push(ValidationError::new(
            "metrics.histogram_buckets",
            "buckets must be finite and strictly ascending",
        ));
    }

    errors
}

/// Validate the base settings and the app's own checks.
pub fn validate_config<C: AppConfig>(config: &C) -> Result<(), Vec<ValidationError>> {
    let mut errors = validate_base(config.base());
    errors.extend(config.validate());

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&BaseConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = BaseConfig::default();
        config.metrics.bind_address = "not-an-address".to_string();
        config.metrics.histogram_buckets = vec![1.0, 0.5];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "metrics.bind_address");
        assert_eq!(errors[1].field, "metrics.histogram_buckets");
    }

    #[test]
    fn test_app_checks_are_included() {
        struct Strict(BaseConfig);
        impl<'de> serde::Deserialize<'de> for Strict {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                BaseConfig::deserialize(d).map(Strict)
            }
        }
        impl AppConfig for Strict {
            fn base(&self) -> &BaseConfig {
                &self.0
            }
            fn validate(&self) -> Vec<ValidationError> {
                vec![ValidationError::new("endpoint", "missing")]
            }
        }

        let errors = validate_config(&Strict(BaseConfig::default())).unwrap_err();
        assert_eq!(errors, vec![ValidationError::new("endpoint", "missing")]);
        assert_eq!(errors[0].to_string(), "endpoint: missing");
    }
}
