mod types;

pub use types::*;

use anyhow::{Context, Result};
use sensorlink_imu::hub::HubSettings;
use sensorlink_imu::ServerSettings;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Returns the config directory, e.g. `~/.config/sensorlink/`.
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("sensorlink");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Returns the default config file path.
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Load config from the default location, or defaults if not found.
pub fn load_config() -> Result<AppConfig> {
    load_config_from(&config_path()?)
}

/// Load config from `path`, or defaults if the file does not exist.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: AppConfig =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        info!(?path, "Loaded config");
        config
    } else {
        info!(?path, "No config found, using defaults");
        AppConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// Save config to the default location.
pub fn save_config(config: &AppConfig) -> Result<()> {
    save_config_to(config, &config_path()?)
}

pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    info!(?path, "Saved config");
    Ok(())
}

impl AppConfig {
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            bind_address: self.server.bind_address.clone(),
            port: self.server.port,
            format: self.server.wire_format,
            rate_window: Duration::from_millis(self.rate.window_ms),
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            integration: self.integration.policy,
            speed_multiplier: self.integration.speed_multiplier,
            reference_rotation: self.integration.reference_rotation,
            default_scale: self.calibration.default_scale,
            gyro_reference_degrees: self.calibration.gyro_reference_degrees,
            accel_reference_distance: self.calibration.accel_reference_distance,
            apply_accel_scale: self.integration.apply_accel_scale,
            connection_policy: self.server.connection_policy,
        }
    }

    /// Seconds per display tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.integration.tick_hz.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlink_imu::fusion::IntegrationPolicy;
    use sensorlink_imu::hub::ConnectionPolicy;
    use sensorlink_imu::types::WireFormat;

    #[test]
    fn defaults_match_observed_setup() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.server.wire_format, WireFormat::Binary24);
        assert_eq!(config.calibration.default_scale, 0.1);
        assert_eq!(config.rate.window_ms, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn toml_round_trip() {
        let mut config = AppConfig::default();
        config.server.wire_format = WireFormat::TextCsv6;
        config.server.connection_policy = ConnectionPolicy::FirstOnly;
        config.integration.policy = IntegrationPolicy::QuaternionDirect;

        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("[server]"));
        assert!(text.contains("wire_format = \"TextCsv6\""));
        assert!(text.contains("reference_rotation = ["));

        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.wire_format, WireFormat::TextCsv6);
        assert_eq!(parsed.server.connection_policy, ConnectionPolicy::FirstOnly);
        assert_eq!(parsed.integration.policy, IntegrationPolicy::QuaternionDirect);
        assert_eq!(
            parsed.integration.reference_rotation,
            config.integration.reference_rotation
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
[server]
port = 4321
wire_format = "Binary28"
"#,
        )
        .unwrap();
        assert_eq!(parsed.server.port, 4321);
        assert_eq!(parsed.server.wire_format, WireFormat::Binary28);
        assert_eq!(parsed.server.bind_address, "0.0.0.0");
        assert_eq!(parsed.integration.tick_hz, 60);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.rate.window_ms = 500;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.integration.tick_hz = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.integration.reference_rotation = glam::Quat::from_xyzw(0.0, 0.0, 0.0, 2.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("sensorlink-missing-config-test.toml");
        let _ = std::fs::remove_file(&path);
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.server.port, 1234);
    }

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!(
            "sensorlink-config-test-{}.toml",
            std::process::id()
        ));
        let mut config = AppConfig::default();
        config.server.port = 5555;
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.server.port, 5555);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn settings_are_derived_from_config() {
        let config = AppConfig::default();
        let server = config.server_settings();
        assert_eq!(server.port, 1234);
        assert_eq!(server.rate_window, Duration::from_millis(1000));

        let hub = config.hub_settings();
        assert_eq!(hub.default_scale, 0.1);
        assert!((config.tick_interval().as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }
}
