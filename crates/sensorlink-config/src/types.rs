use glam::Quat;
use sensorlink_imu::fusion::IntegrationPolicy;
use sensorlink_imu::hub::ConnectionPolicy;
use sensorlink_imu::types::WireFormat;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// TCP server.
    pub server: ServerConfig,
    /// Dead-reckoning integration.
    pub integration: IntegrationConfig,
    /// Per-axis calibration.
    pub calibration: CalibrationConfig,
    /// Sample-rate reporting.
    pub rate: RateConfig,
}

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.integration.tick_hz == 0 {
            anyhow::bail!("integration.tick_hz must be greater than zero");
        }
        if !self.integration.speed_multiplier.is_finite() {
            anyhow::bail!("integration.speed_multiplier must be finite");
        }
        if !self.integration.reference_rotation.is_normalized() {
            anyhow::bail!(
                "integration.reference_rotation must be a unit quaternion, got {:?}",
                self.integration.reference_rotation
            );
        }
        if self.calibration.default_scale <= 0.0 {
            anyhow::bail!("calibration.default_scale must be positive");
        }
        if self.calibration.gyro_reference_degrees <= 0.0
            || self.calibration.accel_reference_distance <= 0.0
        {
            anyhow::bail!("calibration references must be positive");
        }
        if self.rate.window_ms < 1000 {
            anyhow::bail!(
                "rate.window_ms must be at least 1000, got {}",
                self.rate.window_ms
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind, e.g. `0.0.0.0` or `127.0.0.1`.
    pub bind_address: String,
    pub port: u16,
    /// Frame layout every connection is decoded with.
    pub wire_format: WireFormat,
    /// Behaviour when a second sender connects.
    pub connection_policy: ConnectionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 1234,
            wire_format: WireFormat::Binary24,
            connection_policy: ConnectionPolicy::LatestWins,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub policy: IntegrationPolicy,
    /// Display ticks per second.
    pub tick_hz: u32,
    /// Gain applied to velocity when advancing position.
    pub speed_multiplier: f32,
    /// Device-to-world alignment used by "lock to reference", `[x, y, z, w]`.
    #[serde(with = "quat_serde")]
    pub reference_rotation: Quat,
    /// Multiply acceleration by the accelerometer calibration factors.
    pub apply_accel_scale: bool,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            policy: IntegrationPolicy::GyroIntegration,
            tick_hz: 60,
            speed_multiplier: 1.0,
            // Phone lying screen-up: device Z-up onto world Y-up.
            reference_rotation: Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2),
            apply_accel_scale: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Scale factor every axis starts from.
    pub default_scale: f32,
    /// Rotation the operator performs per gyro axis.
    pub gyro_reference_degrees: f32,
    /// Distance in meters the operator moves per accelerometer axis.
    pub accel_reference_distance: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            default_scale: 0.1,
            gyro_reference_degrees: 180.0,
            accel_reference_distance: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Frequency reporting window in milliseconds (minimum 1000).
    pub window_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self { window_ms: 1000 }
    }
}

// Serde helper for glam's Quat so TOML stores a plain array.

mod quat_serde {
    use glam::Quat;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(q: &Quat, s: S) -> Result<S::Ok, S::Error> {
        [q.x, q.y, q.z, q.w].serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Quat, D::Error> {
        let [x, y, z, w] = <[f32; 4]>::deserialize(d)?;
        Ok(Quat::from_xyzw(x, y, z, w))
    }
}
