//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};
use herd_core::PortRange;

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate that a port range is non-empty and does not start at port 0
pub fn validate_port_range(range: &PortRange, field_name: &str, domain: &str) -> ConfigResult<()> {
    if range.is_empty() || range.start == 0 {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!(
                "{} must be a non-empty range of valid ports, got {}..={}",
                field_name, range.start, range.end
            ),
        });
    }
    Ok(())
}

/// Validate an enum-like string against allowed values
pub fn validate_enum_choice(
    value: &str,
    allowed: &[&str],
    field_name: &str,
    domain: &str,
) -> ConfigResult<()> {
    if !allowed.contains(&value.to_lowercase().as_str()) {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!(
                "{} must be one of {:?}, got '{}'",
                field_name, allowed, value
            ),
        });
    }
    Ok(())
}
