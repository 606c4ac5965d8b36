use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How the host reports its own events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level
    pub level: String,

    /// One JSON object per line instead of plain text
    pub json_format: bool,

    /// Add source file and line to each event
    pub include_file_info: bool,

    /// Per-target overrides, e.g. `reqwest = warn`
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = HashMap::new();
        module_levels.insert("bridge_engine".to_string(), "info".to_string());
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("reqwest".to_string(), "warn".to_string());
        module_levels.insert("tungstenite".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            include_file_info: false,
            module_levels,
        }
    }
}

/// Initialize logging on stderr; stdout carries frames
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if !levels::is_valid_level(&config.level) {
        return Err(HostError::Logging(format!("Invalid log level: {}", config.level)));
    }

    let mut filter = EnvFilter::new(&config.level);
    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| HostError::Logging(format!("Invalid log directive: {}", e)))?,
        );
    }

    let json = config.json_format.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
    });
    let plain = (!config.json_format).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_ansi(false)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
    });

    // Already initialized is fine (tests)
    match tracing_subscriber::registry().with(filter).with(json).with(plain).try_init() {
        Ok(_) => tracing::info!("Logging initialized with config level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }
    Ok(())
}

/// Log level utilities
pub mod levels {
    pub fn is_valid_level(level: &str) -> bool {
        matches!(level.to_lowercase().as_str(), "trace" | "debug" | "info" | "warn" | "error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(init_logging(&config), Err(HostError::Logging(_))));
    }

    #[test]
    fn test_init_twice_is_fine() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }
}
