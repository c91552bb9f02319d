use crate::config::{AppConfig, FaultFilterConfigFile, FaultSettingsConfig};
use crate::errors::{FaultError, Result};
use crate::fault::matcher::HeaderMatcher;
use tracing::{debug, warn};

/// Lowest and one-past-highest abort status accepted.
const MIN_ABORT_STATUS: u32 = 200;
const MAX_ABORT_STATUS: u32 = 600;

/// Validate the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    validate_filter_config(&config.filter)?;

    if let Some(path) = &config.runtime_overrides {
        if path.as_os_str().is_empty() {
            return Err(FaultError::ConfigurationError(
                "runtime override path cannot be empty".to_string(),
            ));
        }
    }

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate the filter configuration file, including every route entry
pub fn validate_filter_config(config: &FaultFilterConfigFile) -> Result<()> {
    if config.stat_prefix.is_empty() {
        return Err(FaultError::ConfigurationError(
            "stat_prefix cannot be empty".to_string(),
        ));
    }

    if config.response_buffer_limit_bytes == 0 {
        return Err(FaultError::ConfigurationError(
            "response_buffer_limit_bytes must be greater than 0".to_string(),
        ));
    }

    validate_fault_settings(&config.settings, "default")?;

    for (route, settings) in &config.routes {
        if route.is_empty() {
            return Err(FaultError::ConfigurationError(
                "Route name cannot be empty".to_string(),
            ));
        }
        validate_fault_settings(settings, route)?;
    }

    Ok(())
}

/// Validate the settings of one filter instance or route
pub fn validate_fault_settings(settings: &FaultSettingsConfig, scope: &str) -> Result<()> {
    if let Some(abort) = &settings.abort {
        if !(MIN_ABORT_STATUS..MAX_ABORT_STATUS).contains(&abort.http_status) {
            return Err(FaultError::InvalidAbortStatus(abort.http_status));
        }
        if abort.percentage.numerator > abort.percentage.denominator.value() {
            warn!(
                "Abort percentage for '{}' exceeds its denominator ({}); every request will abort",
                scope, abort.percentage
            );
        }
    }

    if let Some(delay) = &settings.delay {
        if delay.fixed_delay_ms == 0 && !delay.percentage.is_zero() {
            warn!(
                "Delay for '{}' has a zero duration; requests are only deferred to the next timer tick",
                scope
            );
        }
        if delay.fixed_delay_ms > 3_600_000 {
            warn!(
                "Very long delay ({}ms) for '{}'; each delayed request holds an active fault for its duration",
                delay.fixed_delay_ms, scope
            );
        }
    }

    for matcher in &settings.headers {
        HeaderMatcher::from_config(matcher)?;
    }

    if let Some(cluster) = &settings.upstream_cluster {
        if cluster.is_empty() {
            return Err(FaultError::ConfigurationError(format!(
                "upstream_cluster cannot be empty for '{}'",
                scope
            )));
        }
    }

    if settings.downstream_nodes.iter().any(|n| n.is_empty()) {
        return Err(FaultError::ConfigurationError(format!(
            "downstream_nodes contains an empty node name for '{}'",
            scope
        )));
    }

    if settings.max_active_faults == Some(0) {
        warn!(
            "max_active_faults is 0 for '{}'; every selected fault will overflow",
            scope
        );
    }

    if let Some(rate_limit) = &settings.response_rate_limit {
        if rate_limit.fixed_limit.limit_kbps == 0 {
            return Err(FaultError::InvalidRateLimit(format!(
                "limit_kbps must be positive for '{}'",
                scope
            )));
        }
    }

    if settings.abort.is_none() && settings.delay.is_none() && settings.response_rate_limit.is_none()
    {
        warn!("No fault configured for '{}'; the filter is a no-op", scope);
    }

    debug!("Fault settings valid for '{}'", scope);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbortConfig, FixedLimitConfig, ResponseRateLimitConfig};
    use crate::fault::percent::FractionalPercent;

    fn abort(status: u32) -> FaultSettingsConfig {
        FaultSettingsConfig {
            abort: Some(AbortConfig {
                percentage: FractionalPercent::percent(50),
                http_status: status,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_valid_config() {
        let config = AppConfig {
            filter: FaultFilterConfigFile {
                settings: abort(503),
                ..Default::default()
            },
            runtime_overrides: None,
        };

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_abort_status_bounds() {
        assert!(matches!(
            validate_fault_settings(&abort(0), "t"),
            Err(FaultError::InvalidAbortStatus(0))
        ));
        assert!(validate_fault_settings(&abort(199), "t").is_err());
        assert!(validate_fault_settings(&abort(600), "t").is_err());
        assert!(validate_fault_settings(&abort(200), "t").is_ok());
        assert!(validate_fault_settings(&abort(599), "t").is_ok());
    }

    #[test]
    fn test_validate_zero_rate_limit() {
        let settings = FaultSettingsConfig {
            response_rate_limit: Some(ResponseRateLimitConfig {
                fixed_limit: FixedLimitConfig { limit_kbps: 0 },
                percentage: FractionalPercent::percent(100),
            }),
            ..Default::default()
        };

        assert!(matches!(
            validate_fault_settings(&settings, "t"),
            Err(FaultError::InvalidRateLimit(_))
        ));
    }

    #[test]
    fn test_validate_empty_restrictions() {
        let mut settings = abort(503);
        settings.upstream_cluster = Some(String::new());
        assert!(validate_fault_settings(&settings, "t").is_err());

        let mut settings = abort(503);
        settings.downstream_nodes = vec!["a".into(), String::new()];
        assert!(validate_fault_settings(&settings, "t").is_err());
    }

    #[test]
    fn test_validate_routes_and_buffer_limit() {
        let mut config = FaultFilterConfigFile::default();
        config.routes.insert("bad".into(), abort(0));
        assert!(validate_filter_config(&config).is_err());

        let config = FaultFilterConfigFile {
            response_buffer_limit_bytes: 0,
            ..Default::default()
        };
        assert!(validate_filter_config(&config).is_err());
    }
}
