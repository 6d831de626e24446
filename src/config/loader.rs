//! Configuration file loading.

use crate::config::{validate_config, CareConfig};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a YAML file.
///
/// This function reads the file, parses the YAML, and validates the configuration.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CareConfig, ConfigError> {
    let config = read_config(path)?;
    validate_config(&config).map_err(ConfigError::ValidationError)?;
    Ok(config)
}

/// Read and parse a YAML file without validating it.
///
/// For callers that layer further overrides on top and validate the result.
pub fn read_config<P: AsRef<Path>>(path: P) -> Result<CareConfig, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let yaml = r#"
virtual_server:
  address: "10.103.97.2:6443"

real_servers:
  - address: "192.168.0.2:6443"
  - address: "192.168.0.3:6443"
    weight: 2
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.real_servers.len(), 2);
        assert_eq!(config.real_servers[0].weight, 1);
        assert_eq!(config.real_servers[1].weight, 2);
        assert_eq!(config.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/lvscare.yaml");
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not: valid: yaml: {{{}}}").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let yaml = r#"
virtual_server:
  address: "10.103.97.2:6443"
interval: 1s
health_check:
  timeout: 3s
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_read_config_skips_validation() {
        let yaml = r#"
virtual_server:
  address: "10.103.97.2:6443"
health_check:
  timeout: 3s
interval: 1s
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = read_config(file.path()).unwrap();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
