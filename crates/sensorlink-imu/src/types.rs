use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Wire layout a connection speaks. Chosen by configuration, never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WireFormat {
    /// 6 x f32 LE: accel.xyz, gyro.xyz.
    #[default]
    Binary24,
    /// 7 x f32 LE: accel.xyz, quat.xyzw.
    Binary28,
    /// 9 x f32 LE: accel.xyz, gyro.xyz, mag.xyz.
    Binary36,
    /// ASCII `ax,ay,az`.
    TextCsv3,
    /// ASCII `ax,ay,az,gx,gy,gz`.
    TextCsv6,
}

impl WireFormat {
    /// Frame size in bytes for the fixed-size binary layouts.
    pub fn frame_len(self) -> Option<usize> {
        match self {
            WireFormat::Binary24 => Some(24),
            WireFormat::Binary28 => Some(28),
            WireFormat::Binary36 => Some(36),
            WireFormat::TextCsv3 | WireFormat::TextCsv6 => None,
        }
    }

    /// Number of comma-separated fields for the text layouts.
    pub fn text_fields(self) -> Option<usize> {
        match self {
            WireFormat::TextCsv3 => Some(3),
            WireFormat::TextCsv6 => Some(6),
            _ => None,
        }
    }

    pub fn is_binary(self) -> bool {
        self.frame_len().is_some()
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    /// Accepts the variant name or a short alias, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary24" | "bin24" | "24" => Ok(WireFormat::Binary24),
            "binary28" | "bin28" | "28" => Ok(WireFormat::Binary28),
            "binary36" | "bin36" | "36" => Ok(WireFormat::Binary36),
            "textcsv3" | "csv3" | "text3" => Ok(WireFormat::TextCsv3),
            "textcsv6" | "csv6" | "text6" => Ok(WireFormat::TextCsv6),
            other => Err(format!(
                "unknown wire format '{other}' (expected binary24, binary28, binary36, csv3 or csv6)"
            )),
        }
    }
}

/// One decoded unit of sensor data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorFrame {
    SixAxis { accel: Vec3, gyro: Vec3 },
    SevenField { accel: Vec3, quat: Quat },
    NineAxis { accel: Vec3, gyro: Vec3, mag: Vec3 },
    TextTriple { accel: Vec3 },
    TextSix { accel: Vec3, gyro: Vec3 },
}

impl SensorFrame {
    /// Linear acceleration (m/s^2). Every layout carries it.
    pub fn accel(&self) -> Vec3 {
        match *self {
            SensorFrame::SixAxis { accel, .. }
            | SensorFrame::SevenField { accel, .. }
            | SensorFrame::NineAxis { accel, .. }
            | SensorFrame::TextTriple { accel }
            | SensorFrame::TextSix { accel, .. } => accel,
        }
    }

    /// Angular rate, if the layout carries one.
    pub fn gyro(&self) -> Option<Vec3> {
        match *self {
            SensorFrame::SixAxis { gyro, .. }
            | SensorFrame::NineAxis { gyro, .. }
            | SensorFrame::TextSix { gyro, .. } => Some(gyro),
            SensorFrame::SevenField { .. } | SensorFrame::TextTriple { .. } => None,
        }
    }

    /// Sender-supplied absolute orientation, exactly as received.
    pub fn quat(&self) -> Option<Quat> {
        match *self {
            SensorFrame::SevenField { quat, .. } => Some(quat),
            _ => None,
        }
    }

    pub fn mag(&self) -> Option<Vec3> {
        match *self {
            SensorFrame::NineAxis { mag, .. } => Some(mag),
            _ => None,
        }
    }

    /// True when no component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.accel().is_finite()
            && self.gyro().map_or(true, Vec3::is_finite)
            && self.quat().map_or(true, Quat::is_finite)
            && self.mag().map_or(true, Vec3::is_finite)
    }
}

/// Rotation, velocity and position estimated by dead reckoning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationState {
    /// Unit quaternion.
    pub rotation: Quat,
    pub velocity: Vec3,
    pub position: Vec3,
}

impl Default for OrientationState {
    fn default() -> Self {
        Self {
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            position: Vec3::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_parses_names_and_aliases() {
        assert_eq!("Binary28".parse::<WireFormat>(), Ok(WireFormat::Binary28));
        assert_eq!("csv6".parse::<WireFormat>(), Ok(WireFormat::TextCsv6));
        assert_eq!("36".parse::<WireFormat>(), Ok(WireFormat::Binary36));
        assert!("json".parse::<WireFormat>().is_err());
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(WireFormat::Binary24.frame_len(), Some(24));
        assert_eq!(WireFormat::Binary36.frame_len(), Some(36));
        assert_eq!(WireFormat::TextCsv3.text_fields(), Some(3));
        assert!(!WireFormat::TextCsv6.is_binary());
    }
}
