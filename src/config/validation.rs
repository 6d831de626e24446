//! Configuration validation.

use crate::config::{CareConfig, HealthScheme};
use std::collections::HashSet;
use std::time::Duration;

/// Largest weight the kernel accepts for a real server.
pub const MAX_WEIGHT: u32 = 65535;

/// Validate the configuration.
///
/// Checks for:
/// - Real server weights between 1 and the IPVS maximum
/// - No duplicate real server addresses
/// - No real server pointing back at the virtual address
/// - Non-zero interval and probe timeout, with the timeout shorter than the interval
/// - HTTP(S) health checks with an absolute path
///
/// An empty real server list is valid: the virtual server is simply drained.
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &CareConfig) -> Result<(), String> {
    let mut errors = Vec::new();
    let vip = config.virtual_server.address;

    let mut seen = HashSet::new();
    for server in &config.real_servers {
        if !seen.insert(server.address) {
            errors.push(format!("duplicate real server address: {}", server.address));
        }

        if server.weight == 0 {
            errors.push(format!(
                "real server {} has weight 0 (must be >= 1)",
                server.address
            ));
        } else if server.weight > MAX_WEIGHT {
            errors.push(format!(
                "real server {} has weight {} (must be <= {})",
                server.address, server.weight, MAX_WEIGHT
            ));
        }

        if server.address == vip {
            errors.push(format!(
                "real server {} is the virtual server address",
                server.address
            ));
        }
    }

    if config.interval == Duration::ZERO {
        errors.push("interval must be greater than zero".to_string());
    }

    let hc = &config.health_check;
    if hc.timeout == Duration::ZERO {
        errors.push("health check timeout must be greater than zero".to_string());
    } else if hc.timeout >= config.interval {
        errors.push(format!(
            "health check timeout ({}) must be shorter than the interval ({})",
            humantime::format_duration(hc.timeout),
            humantime::format_duration(config.interval)
        ));
    }

    if hc.scheme != HealthScheme::Tcp && !hc.path.starts_with('/') {
        errors.push(format!(
            "{} health check path '{}' must start with '/'",
            hc.scheme, hc.path
        ));
    }

    if let Some(status) = hc.expected_status {
        if !(100..=599).contains(&status) {
            errors.push(format!("expected status {} is not a valid HTTP status", status));
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
