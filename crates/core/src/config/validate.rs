use super::{types::Config, ConfigError, RosterSourceKind};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Broker url and exchange are set, prefetch is not 0
/// - The http roster source has a url
/// - The work-item service has a base url
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.broker.url.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "broker.url cannot be empty".to_string(),
        ));
    }

    if config.broker.exchange.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "broker.exchange cannot be empty".to_string(),
        ));
    }

    if config.broker.prefetch_count == 0 {
        return Err(ConfigError::ValidationError(
            "broker.prefetch_count cannot be 0".to_string(),
        ));
    }

    if config.roster.source == RosterSourceKind::Http
        && config.roster.url.as_deref().is_none_or(|u| u.trim().is_empty())
    {
        return Err(ConfigError::ValidationError(
            "roster.url is required when roster.source = \"http\"".to_string(),
        ));
    }

    if config.work_items.base_url.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "work_items.base_url cannot be empty".to_string(),
        ));
    }

    Ok(())
}
