//! Guided per-axis calibration.
//!
//! The operator walks each axis in turn: arm with a start signal, perform a
//! known motion (half a turn for the gyroscope, a reference distance for the
//! accelerometer), then stop. The controller compares what the integrator
//! measured against the reference and corrects that axis' scale factor.

use glam::{Quat, Vec3};
use thiserror::Error;

pub const AXIS_COUNT: usize = 3;
/// Scale factor each axis starts from.
pub const DEFAULT_SCALE: f32 = 0.1;
/// Half a turn, in degrees: the gyroscope reference motion.
pub const GYRO_REFERENCE_DEGREES: f32 = 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Gyro,
    Accel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    AwaitingStart,
    Armed,
    AwaitingStop,
    Done,
}

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("stop ignored: axis not armed (phase {0:?})")]
    NotArmed(CalibrationPhase),
    #[error("degenerate capture {captured} on axis {axis}, keeping scale {kept}")]
    DegenerateCapture { axis: usize, captured: f32, kept: f32 },
}

/// Result of a stop signal that was accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisResult {
    pub axis: usize,
    pub captured: f32,
    pub scale: f32,
}

/// Read-only view for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationView {
    pub kind: SensorKind,
    pub phase: CalibrationPhase,
    pub axis: Option<usize>,
    pub prompt: String,
    pub scale_factors: [f32; AXIS_COUNT],
    pub start_enabled: bool,
    pub stop_enabled: bool,
}

pub struct CalibrationController {
    kind: SensorKind,
    phase: CalibrationPhase,
    /// `None` means no axis is being calibrated.
    axis: Option<usize>,
    scale_factors: [f32; AXIS_COUNT],
    reference: f32,
    reference_rotation: Quat,
    prompt: String,
}

impl CalibrationController {
    pub fn new(kind: SensorKind, reference: f32, default_scale: f32) -> Self {
        Self {
            kind,
            phase: CalibrationPhase::Idle,
            axis: None,
            scale_factors: [default_scale; AXIS_COUNT],
            reference,
            reference_rotation: Quat::IDENTITY,
            prompt: String::new(),
        }
    }

    pub fn gyro() -> Self {
        Self::new(SensorKind::Gyro, GYRO_REFERENCE_DEGREES, DEFAULT_SCALE)
    }

    pub fn accel(reference_distance: f32) -> Self {
        Self::new(SensorKind::Accel, reference_distance, DEFAULT_SCALE)
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn axis(&self) -> Option<usize> {
        self.axis
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn scale_factors(&self) -> [f32; AXIS_COUNT] {
        self.scale_factors
    }

    pub fn scale_vector(&self) -> Vec3 {
        Vec3::from_array(self.scale_factors)
    }

    pub fn reference_rotation(&self) -> Quat {
        self.reference_rotation
    }

    pub fn in_progress(&self) -> bool {
        matches!(
            self.phase,
            CalibrationPhase::AwaitingStart | CalibrationPhase::Armed | CalibrationPhase::AwaitingStop
        )
    }

    pub fn start_enabled(&self) -> bool {
        self.phase == CalibrationPhase::AwaitingStart
    }

    pub fn stop_enabled(&self) -> bool {
        self.phase == CalibrationPhase::Armed
    }

    /// Begin a run at the first axis. Returns `false` if a run is already
    /// in progress.
    pub fn begin(&mut self) -> bool {
        if self.in_progress() {
            tracing::debug!(kind = ?self.kind, "Calibration already running, begin ignored");
            return false;
        }
        self.await_axis(0);
        tracing::info!(kind = ?self.kind, "Calibration run started");
        true
    }

    /// Arm the current axis, measuring later rotation relative to
    /// `reference`. Returns `false` unless awaiting a start.
    pub fn start(&mut self, reference: Quat) -> bool {
        if self.phase != CalibrationPhase::AwaitingStart {
            tracing::debug!(kind = ?self.kind, phase = ?self.phase, "Start ignored");
            return false;
        }
        self.reference_rotation = reference;
        self.phase = CalibrationPhase::Armed;
        tracing::info!(kind = ?self.kind, axis = ?self.axis, "Axis armed");
        true
    }

    /// Finish the armed axis with the value the integrator measured.
    ///
    /// A degenerate capture keeps the previous factor but still advances the
    /// run.
    pub fn stop(&mut self, captured: f32) -> Result<AxisResult, CalibrationError> {
        let axis = match (self.phase, self.axis) {
            (CalibrationPhase::Armed, Some(axis)) => axis,
            _ => return Err(CalibrationError::NotArmed(self.phase)),
        };
        self.phase = CalibrationPhase::AwaitingStop;

        let previous = self.scale_factors[axis];
        let corrected = 1.0 / (captured / (self.reference * previous));
        let outcome = if captured == 0.0 || !corrected.is_finite() {
            tracing::warn!(
                kind = ?self.kind,
                axis,
                captured,
                kept = previous,
                "Degenerate calibration capture, keeping previous scale"
            );
            Err(CalibrationError::DegenerateCapture {
                axis,
                captured,
                kept: previous,
            })
        } else {
            self.scale_factors[axis] = corrected;
            tracing::info!(kind = ?self.kind, axis, captured, scale = corrected, "Axis calibrated");
            Ok(AxisResult {
                axis,
                captured,
                scale: corrected,
            })
        };

        if axis + 1 < AXIS_COUNT {
            self.await_axis(axis + 1);
        } else {
            self.finish();
        }
        outcome
    }

    /// Degrees turned about `axis` since the axis was armed.
    pub fn measured_angle(&self, rotation: Quat, axis: usize) -> f32 {
        twist_angle_degrees(self.reference_rotation.inverse() * rotation, axis)
    }

    pub fn view(&self) -> CalibrationView {
        CalibrationView {
            kind: self.kind,
            phase: self.phase,
            axis: self.axis,
            prompt: self.prompt.clone(),
            scale_factors: self.scale_factors,
            start_enabled: self.start_enabled(),
            stop_enabled: self.stop_enabled(),
        }
    }

    fn await_axis(&mut self, axis: usize) {
        self.axis = Some(axis);
        self.phase = CalibrationPhase::AwaitingStart;
        self.prompt = format!("Calibrate axis {}", axis + 1);
    }

    fn finish(&mut self) {
        self.axis = None;
        self.phase = CalibrationPhase::Done;
        self.prompt = "Calibration complete".to_string();
        tracing::info!(kind = ?self.kind, scale = ?self.scale_factors, "Calibration complete");
    }
}

/// Rotation of `rotation` about one principal axis, in degrees `[0, 360)`.
///
/// Uses the twist component of a swing-twist decomposition, so a half turn
/// about any axis reads as 180 regardless of Euler ordering.
pub fn twist_angle_degrees(rotation: Quat, axis: usize) -> f32 {
    // q and -q are the same rotation; pick the w >= 0 hemisphere.
    let rotation = if rotation.w < 0.0 { -rotation } else { rotation };
    let v = [rotation.x, rotation.y, rotation.z];
    let along = v.get(axis).copied().unwrap_or(0.0);
    let angle = 2.0 * along.atan2(rotation.w);
    angle.to_degrees().rem_euclid(360.0)
}
