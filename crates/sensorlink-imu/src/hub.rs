//! Shared sensor state.
//!
//! Sessions write decoded frames in, the display tick advances the
//! integrator, and the presentation layer reads snapshots out. Everything
//! sits behind one mutex that is never held across an `.await`.

use crate::calibration::{
    AxisResult, CalibrationController, CalibrationError, CalibrationView,
    SensorKind, DEFAULT_SCALE, GYRO_REFERENCE_DEGREES,
};
use crate::fusion::{IntegrationPolicy, OrientationIntegrator};
use crate::protocol::FormatError;
use crate::types::{OrientationState, SensorFrame};
use glam::Quat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

pub type SessionId = u64;

/// What to do when more than one sender is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionPolicy {
    /// Accept everyone; the most recently routed sample drives the state.
    #[default]
    LatestWins,
    /// Refuse new connections while one session is open.
    FirstOnly,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub integration: IntegrationPolicy,
    pub speed_multiplier: f32,
    pub reference_rotation: Quat,
    pub default_scale: f32,
    pub gyro_reference_degrees: f32,
    pub accel_reference_distance: f32,
    pub apply_accel_scale: bool,
    pub connection_policy: ConnectionPolicy,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            integration: IntegrationPolicy::default(),
            speed_multiplier: 1.0,
            reference_rotation: Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2),
            default_scale: DEFAULT_SCALE,
            gyro_reference_degrees: GYRO_REFERENCE_DEGREES,
            accel_reference_distance: 1.0,
            apply_accel_scale: false,
            connection_policy: ConnectionPolicy::default(),
        }
    }
}

/// Everything a presentation layer needs for one frame of output.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub orientation: OrientationState,
    pub last_frame: Option<SensorFrame>,
    pub frequency_hz: Option<f32>,
    pub gyro_calibration: CalibrationView,
    pub accel_calibration: CalibrationView,
    pub active_sessions: usize,
    pub routed_session: Option<SessionId>,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub last_warning: Option<String>,
}

struct HubState {
    integrator: OrientationIntegrator,
    gyro: CalibrationController,
    accel: CalibrationController,
    last_frame: Option<SensorFrame>,
    frequency_hz: Option<f32>,
    sessions: BTreeSet<SessionId>,
    routed: Option<SessionId>,
    next_session: SessionId,
    frames_accepted: u64,
    frames_rejected: u64,
    last_warning: Option<String>,
}

impl HubState {
    fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            orientation: self.integrator.state(),
            last_frame: self.last_frame,
            frequency_hz: self.frequency_hz,
            gyro_calibration: self.gyro.view(),
            accel_calibration: self.accel.view(),
            active_sessions: self.sessions.len(),
            routed_session: self.routed,
            frames_accepted: self.frames_accepted,
            frames_rejected: self.frames_rejected,
            last_warning: self.last_warning.clone(),
        }
    }

    fn controller(&mut self, kind: SensorKind) -> &mut CalibrationController {
        match kind {
            SensorKind::Gyro => &mut self.gyro,
            SensorKind::Accel => &mut self.accel,
        }
    }
}

pub struct SensorHub {
    connection_policy: ConnectionPolicy,
    apply_accel_scale: bool,
    state: Mutex<HubState>,
    snapshot_tx: watch::Sender<SensorSnapshot>,
}

impl SensorHub {
    pub fn new(settings: HubSettings) -> Self {
        let state = HubState {
            integrator: OrientationIntegrator::new(
                settings.integration,
                settings.speed_multiplier,
                settings.reference_rotation,
            ),
            gyro: CalibrationController::new(
                SensorKind::Gyro,
                settings.gyro_reference_degrees,
                settings.default_scale,
            ),
            accel: CalibrationController::new(
                SensorKind::Accel,
                settings.accel_reference_distance,
                settings.default_scale,
            ),
            last_frame: None,
            frequency_hz: None,
            sessions: BTreeSet::new(),
            routed: None,
            next_session: 1,
            frames_accepted: 0,
            frames_rejected: 0,
            last_warning: None,
        };
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        Self {
            connection_policy: settings.connection_policy,
            apply_accel_scale: settings.apply_accel_scale,
            state: Mutex::new(state),
            snapshot_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.lock().snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` under the lock and publish the resulting snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut HubState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        self.snapshot_tx.send_replace(state.snapshot());
        result
    }

    // ------------------------------------------------------------------
    // Session side
    // ------------------------------------------------------------------

    /// Register a new connection, or `None` if the policy refuses it.
    pub fn open_session(&self) -> Option<SessionId> {
        let policy = self.connection_policy;
        self.update(|state| {
            if policy == ConnectionPolicy::FirstOnly && !state.sessions.is_empty() {
                return None;
            }
            let id = state.next_session;
            state.next_session += 1;
            state.sessions.insert(id);
            Some(id)
        })
    }

    pub fn close_session(&self, id: SessionId) {
        self.update(|state| {
            state.sessions.remove(&id);
            if state.routed == Some(id) {
                state.routed = None;
                state.frequency_hz = None;
                state.integrator.clear_inputs();
            }
        });
    }

    /// Route a decoded frame into the shared state. Frames with NaN or
    /// infinite components are counted as rejected and never integrated.
    pub fn accept_frame(&self, id: SessionId, frame: &SensorFrame) {
        if !frame.is_finite() {
            tracing::warn!(session = id, ?frame, "Dropping non-finite frame");
            self.reject_frame(id, &FormatError::NonFinite);
            return;
        }
        self.update(|state| {
            if state.routed != Some(id) {
                tracing::debug!(session = id, previous = ?state.routed, "Routing samples from session");
                state.routed = Some(id);
            }
            state.integrator.ingest(frame);
            state.last_frame = Some(*frame);
            state.frames_accepted += 1;
        });
    }

    /// Count a dropped frame and surface the reason.
    pub fn reject_frame(&self, id: SessionId, error: &FormatError) {
        self.update(|state| {
            state.frames_rejected += 1;
            state.last_warning = Some(format!("session {id}: {error}"));
        });
    }

    /// Record a completed rate window. Only the routed session's rate shows.
    pub fn report_frequency(&self, id: SessionId, hz: f32) {
        self.update(|state| {
            if state.routed.is_none() || state.routed == Some(id) {
                state.frequency_hz = Some(hz);
            }
        });
    }

    // ------------------------------------------------------------------
    // Host side
    // ------------------------------------------------------------------

    /// One display tick of `dt` seconds.
    pub fn tick(&self, dt: f32) {
        let apply_accel_scale = self.apply_accel_scale;
        self.update(|state| {
            let gyro_scale = state.gyro.scale_vector();
            let accel_scale = apply_accel_scale.then(|| state.accel.scale_vector());
            state.integrator.tick(dt, gyro_scale, accel_scale);
        });
    }

    pub fn reset_rotation(&self) {
        self.update(|state| state.integrator.reset_rotation());
    }

    pub fn lock_to_reference(&self) {
        self.update(|state| state.integrator.lock_to_reference());
    }

    pub fn reset_motion(&self) {
        self.update(|state| state.integrator.reset_motion());
    }

    pub fn begin_calibration(&self, kind: SensorKind) -> bool {
        self.update(|state| state.controller(kind).begin())
    }

    /// Arm the current axis. The gyro run restarts from identity rotation;
    /// the accelerometer run restarts from rest at the origin.
    pub fn start_calibration(&self, kind: SensorKind) -> bool {
        self.update(|state| {
            if !state.controller(kind).start_enabled() {
                tracing::debug!(?kind, phase = ?state.controller(kind).phase(), "Start ignored");
                return false;
            }
            match kind {
                SensorKind::Gyro => state.integrator.reset_rotation(),
                SensorKind::Accel => state.integrator.reset_motion(),
            }
            let reference = state.integrator.rotation();
            state.controller(kind).start(reference)
        })
    }

    /// Capture the integrator's measurement for the armed axis.
    pub fn stop_calibration(&self, kind: SensorKind) -> Result<AxisResult, CalibrationError> {
        self.update(|state| {
            let orientation = state.integrator.state();
            let controller = state.controller(kind);
            let Some(axis) = controller.axis().filter(|_| controller.stop_enabled()) else {
                return Err(CalibrationError::NotArmed(controller.phase()));
            };
            let captured = match kind {
                SensorKind::Gyro => controller.measured_angle(orientation.rotation, axis),
                SensorKind::Accel => orientation.position[axis],
            };
            let result = controller.stop(captured);
            if let Err(error) = &result {
                state.last_warning = Some(error.to_string());
            }
            result
        })
    }

    pub fn begin_gyro_calibration(&self) -> bool {
        self.begin_calibration(SensorKind::Gyro)
    }

    pub fn start_gyro_calibration(&self) -> bool {
        self.start_calibration(SensorKind::Gyro)
    }

    pub fn stop_gyro_calibration(&self) -> Result<AxisResult, CalibrationError> {
        self.stop_calibration(SensorKind::Gyro)
    }

    pub fn begin_accel_calibration(&self) -> bool {
        self.begin_calibration(SensorKind::Accel)
    }

    pub fn start_accel_calibration(&self) -> bool {
        self.start_calibration(SensorKind::Accel)
    }

    pub fn stop_accel_calibration(&self) -> Result<AxisResult, CalibrationError> {
        self.stop_calibration(SensorKind::Accel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPhase;
    use glam::Vec3;

    fn hub() -> SensorHub {
        SensorHub::new(HubSettings::default())
    }

    fn six(accel: Vec3, gyro: Vec3) -> SensorFrame {
        SensorFrame::SixAxis { accel, gyro }
    }

    #[test]
    fn frames_update_snapshot_and_watchers() {
        let hub = hub();
        let mut rx = hub.subscribe();
        let id = hub.open_session().unwrap();
        hub.accept_frame(id, &six(Vec3::new(0.0, 0.0, 9.8), Vec3::ZERO));

        assert!(rx.has_changed().unwrap());
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.frames_accepted, 1);
        assert_eq!(snap.routed_session, Some(id));
        assert_eq!(snap.last_frame.unwrap().accel(), Vec3::new(0.0, 0.0, 9.8));
    }

    #[test]
    fn rejected_frames_leave_orientation_alone() {
        let hub = hub();
        let id = hub.open_session().unwrap();
        let before = hub.snapshot().orientation;
        hub.reject_frame(
            id,
            &FormatError::FieldCount {
                expected: 6,
                actual: 4,
            },
        );
        hub.tick(0.1);

        let snap = hub.snapshot();
        assert_eq!(snap.orientation, before);
        assert_eq!(snap.frames_rejected, 1);
        assert!(snap.last_warning.unwrap().contains("expected 6 fields"));
    }

    #[test]
    fn latest_session_wins() {
        let hub = hub();
        let a = hub.open_session().unwrap();
        let b = hub.open_session().unwrap();
        hub.accept_frame(a, &six(Vec3::X, Vec3::ZERO));
        hub.accept_frame(b, &six(Vec3::Y, Vec3::ZERO));

        let snap = hub.snapshot();
        assert_eq!(snap.active_sessions, 2);
        assert_eq!(snap.routed_session, Some(b));
        assert_eq!(snap.last_frame.unwrap().accel(), Vec3::Y);

        hub.report_frequency(b, 100.0);
        assert_eq!(hub.snapshot().frequency_hz, Some(100.0));

        hub.close_session(b);
        let snap = hub.snapshot();
        assert_eq!(snap.routed_session, None);
        assert_eq!(snap.frequency_hz, None);
    }

    #[test]
    fn non_finite_frame_never_reaches_the_integrator() {
        let hub = hub();
        let id = hub.open_session().unwrap();
        let poisoned = six(
            Vec3::new(f32::NAN, 0.0, 0.0),
            Vec3::new(0.0, f32::INFINITY, 0.0),
        );
        hub.accept_frame(id, &poisoned);
        hub.tick(0.1);

        let snap = hub.snapshot();
        assert_eq!(snap.frames_accepted, 0);
        assert_eq!(snap.frames_rejected, 1);
        assert!(snap.last_frame.is_none());
        assert!(snap.last_warning.is_some());

        hub.accept_frame(id, &six(Vec3::ZERO, Vec3::ZERO));
        for _ in 0..10 {
            hub.tick(0.1);
        }
        let state = hub.snapshot().orientation;
        assert!(state.rotation.is_finite());
        assert!(state.velocity.is_finite());
        assert!(state.position.is_finite());
    }

    #[test]
    fn quaternion_with_nan_is_not_assigned() {
        let hub = SensorHub::new(HubSettings {
            integration: IntegrationPolicy::QuaternionDirect,
            ..HubSettings::default()
        });
        let id = hub.open_session().unwrap();
        hub.accept_frame(
            id,
            &SensorFrame::SevenField {
                accel: Vec3::ZERO,
                quat: Quat::from_xyzw(f32::NAN, 0.0, 0.0, 1.0),
            },
        );
        assert_eq!(hub.snapshot().orientation.rotation, Quat::IDENTITY);
    }

    #[test]
    fn first_only_refuses_second_sender() {
        let hub = SensorHub::new(HubSettings {
            connection_policy: ConnectionPolicy::FirstOnly,
            ..HubSettings::default()
        });
        let a = hub.open_session().unwrap();
        assert!(hub.open_session().is_none());
        hub.close_session(a);
        assert!(hub.open_session().is_some());
    }

    #[test]
    fn gyro_calibration_uses_integrated_rotation() {
        let hub = hub();
        let id = hub.open_session().unwrap();
        assert!(hub.begin_gyro_calibration());
        assert!(hub.start_gyro_calibration());

        // 900 deg/tick * 0.1 scale = 90 degrees about X per tick.
        hub.accept_frame(id, &six(Vec3::ZERO, Vec3::new(900.0, 0.0, 0.0)));
        hub.tick(0.01);

        // 1 / (90 / (180 * 0.1)) = 0.2
        let result = hub.stop_gyro_calibration().unwrap();
        assert_eq!(result.axis, 0);
        assert!((result.captured - 90.0).abs() < 1e-2);
        assert!((result.scale - 0.2).abs() < 1e-4);

        let view = hub.snapshot().gyro_calibration;
        assert_eq!(view.axis, Some(1));
        assert_eq!(view.prompt, "Calibrate axis 2");
    }

    #[test]
    fn start_resets_rotation_for_gyro_run() {
        let hub = hub();
        hub.lock_to_reference();
        assert_ne!(hub.snapshot().orientation.rotation, Quat::IDENTITY);

        hub.begin_gyro_calibration();
        hub.start_gyro_calibration();
        assert_eq!(hub.snapshot().orientation.rotation, Quat::IDENTITY);
    }

    #[test]
    fn zero_capture_surfaces_warning() {
        let hub = hub();
        hub.begin_gyro_calibration();
        hub.start_gyro_calibration();
        let err = hub.stop_gyro_calibration().unwrap_err();
        assert!(matches!(err, CalibrationError::DegenerateCapture { axis: 0, .. }));

        let snap = hub.snapshot();
        assert_eq!(snap.gyro_calibration.scale_factors[0], DEFAULT_SCALE);
        assert!(snap.last_warning.is_some());
    }

    #[test]
    fn stop_without_arm_is_ignored() {
        let hub = hub();
        assert_eq!(
            hub.stop_gyro_calibration(),
            Err(CalibrationError::NotArmed(CalibrationPhase::Idle))
        );
        hub.begin_gyro_calibration();
        assert_eq!(
            hub.stop_gyro_calibration(),
            Err(CalibrationError::NotArmed(CalibrationPhase::AwaitingStart))
        );
        assert_eq!(hub.snapshot().gyro_calibration.axis, Some(0));
    }

    #[test]
    fn accel_calibration_measures_displacement() {
        let hub = hub();
        let id = hub.open_session().unwrap();
        hub.begin_accel_calibration();
        assert!(hub.start_accel_calibration());

        // One tick of 1 m/s^2 for 1 s moves 1 m along X.
        hub.accept_frame(id, &SensorFrame::TextTriple { accel: Vec3::X });
        hub.tick(1.0);

        let result = hub.stop_accel_calibration().unwrap();
        assert!((result.captured - 1.0).abs() < 1e-6);
        assert!((result.scale - DEFAULT_SCALE).abs() < 1e-6);
        assert_eq!(hub.snapshot().gyro_calibration.phase, CalibrationPhase::Idle);
    }
}
