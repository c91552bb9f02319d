use crate::config::validator::{validate_config, validate_filter_config};
use crate::config::{AppConfig, FaultFilterConfigFile, FaultSettingsConfig};
use crate::errors::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load the fault filter configuration from a JSON file
pub async fn load_filter_config_from_file<P: AsRef<Path>>(
    path: P,
) -> Result<FaultFilterConfigFile> {
    let path = path.as_ref();
    info!("Loading fault filter configuration from: {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;
    let config: FaultFilterConfigFile = serde_json::from_str(&contents)?;
    validate_filter_config(&config)?;

    info!("Fault filter configuration loaded and validated successfully");
    log_filter_config_summary(&config);

    Ok(config)
}

/// Load complete application configuration
/// - Filter config from the JSON file named by `FAULT_FILTER_CONFIG`
/// - Optional runtime override file from `FAULT_RUNTIME_OVERRIDES`
pub async fn load_config() -> Result<AppConfig> {
    info!("Loading application configuration...");

    let config_path = std::env::var("FAULT_FILTER_CONFIG")
        .unwrap_or_else(|_| "config/fault.json".to_string());
    debug!("Fault filter config path: {}", config_path);

    let filter = load_filter_config_from_file(&config_path).await?;
    let runtime_overrides = std::env::var("FAULT_RUNTIME_OVERRIDES")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);

    let app_config = AppConfig {
        filter,
        runtime_overrides,
    };
    validate_config(&app_config)?;

    info!("Application configuration loaded and validated successfully");
    match &app_config.runtime_overrides {
        Some(path) => info!("Runtime overrides: {}", path.display()),
        None => info!("Runtime overrides: none"),
    }

    Ok(app_config)
}

fn log_filter_config_summary(config: &FaultFilterConfigFile) {
    debug!("=== Fault Filter Summary ===");
    debug!("Stat prefix: {}", config.stat_prefix);
    debug!(
        "Response buffer limit: {} bytes",
        config.response_buffer_limit_bytes
    );
    log_settings_summary("default", &config.settings);

    for (route, settings) in &config.routes {
        log_settings_summary(route, settings);
    }
    debug!("============================");
}

fn log_settings_summary(scope: &str, settings: &FaultSettingsConfig) {
    debug!("  Policy: {}", scope);
    if let Some(abort) = &settings.abort {
        debug!("    - abort: {} with status {}", abort.percentage, abort.http_status);
    }
    if let Some(delay) = &settings.delay {
        debug!("    - delay: {} for {}ms", delay.percentage, delay.fixed_delay_ms);
    }
    if let Some(limit) = &settings.response_rate_limit {
        debug!(
            "    - response rate limit: {} at {} kbps",
            limit.percentage, limit.fixed_limit.limit_kbps
        );
    }
    if !settings.headers.is_empty() {
        debug!("    - header matchers: {}", settings.headers.len());
    }
    if let Some(cluster) = &settings.upstream_cluster {
        debug!("    - upstream cluster: {}", cluster);
    }
    if !settings.downstream_nodes.is_empty() {
        debug!("    - downstream nodes: {:?}", settings.downstream_nodes);
    }
    if let Some(max) = settings.max_active_faults {
        debug!("    - max active faults: {}", max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FaultError;
    use crate::fault::percent::{DenominatorType, FractionalPercent};
    use std::io::Write;

    #[tokio::test]
    async fn test_load_filter_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "stat_prefix": "edge",
                "abort": {{"percentage": {{"numerator": 10}}, "http_status": 503}},
                "delay": {{"percentage": {{"numerator": 5, "denominator": "TEN_THOUSAND"}}, "fixed_delay_ms": 200}},
                "headers": [{{"name": "x-fault", "exact_match": "on"}}],
                "max_active_faults": 3,
                "routes": {{
                    "checkout": {{"abort": {{"percentage": {{"numerator": 100}}, "http_status": 502}}}}
                }}
            }}"#
        )
        .unwrap();

        let config = load_filter_config_from_file(file.path()).await.unwrap();
        assert_eq!(config.stat_prefix, "edge");
        assert_eq!(config.response_buffer_limit_bytes, 1024 * 1024);

        let abort = config.settings.abort.as_ref().unwrap();
        assert_eq!(abort.percentage, FractionalPercent::percent(10));
        let delay = config.settings.delay.as_ref().unwrap();
        assert_eq!(
            delay.percentage,
            FractionalPercent::new(5, DenominatorType::TenThousand)
        );
        assert_eq!(config.settings.headers.len(), 1);
        assert_eq!(config.settings.max_active_faults, Some(3));
        assert_eq!(config.routes["checkout"].abort.as_ref().unwrap().http_status, 502);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_status() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"abort": {{"percentage": {{"numerator": 1}}, "http_status": 99}}}}"#
        )
        .unwrap();

        let err = load_filter_config_from_file(file.path()).await.unwrap_err();
        assert!(matches!(err, FaultError::InvalidAbortStatus(99)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_filter_config_from_file("/nonexistent/fault.json")
            .await
            .unwrap_err();
        assert!(matches!(err, FaultError::FileSystemError(_)));
    }
}
