use crate::types::{OrientationState, SensorFrame};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// How rotation is derived from incoming frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IntegrationPolicy {
    /// Integrate angular rate once per display tick.
    #[default]
    GyroIntegration,
    /// Take the sender's quaternion as absolute orientation.
    QuaternionDirect,
}

/// Euler increment in degrees, composed Y, then X, then Z.
pub fn quat_from_euler_degrees(euler: Vec3) -> Quat {
    Quat::from_rotation_y(euler.y.to_radians())
        * Quat::from_rotation_x(euler.x.to_radians())
        * Quat::from_rotation_z(euler.z.to_radians())
}

/// Dead-reckoning integrator.
///
/// Frames are latched by `ingest`; the state only advances on `tick`, which
/// the host calls at its display rate. In quaternion-direct mode the
/// rotation is replaced as soon as a quaternion arrives.
pub struct OrientationIntegrator {
    policy: IntegrationPolicy,
    speed_multiplier: f32,
    /// Device-to-world alignment used by `lock_to_reference`.
    reference_rotation: Quat,
    state: OrientationState,
    latest_accel: Option<Vec3>,
    latest_gyro: Option<Vec3>,
}

impl OrientationIntegrator {
    pub fn new(policy: IntegrationPolicy, speed_multiplier: f32, reference_rotation: Quat) -> Self {
        Self {
            policy,
            speed_multiplier,
            reference_rotation,
            state: OrientationState::default(),
            latest_accel: None,
            latest_gyro: None,
        }
    }

    pub fn policy(&self) -> IntegrationPolicy {
        self.policy
    }

    pub fn state(&self) -> OrientationState {
        self.state
    }

    pub fn rotation(&self) -> Quat {
        self.state.rotation
    }

    /// Latch the newest sample.
    pub fn ingest(&mut self, frame: &SensorFrame) {
        self.latest_accel = Some(frame.accel());
        if let Some(gyro) = frame.gyro() {
            self.latest_gyro = Some(gyro);
        }
        if self.policy == IntegrationPolicy::QuaternionDirect {
            if let Some(quat) = frame.quat() {
                self.state.rotation = quat;
            }
        }
    }

    /// Advance one display tick of `dt` seconds.
    ///
    /// `gyro_scale` multiplies the latched angular rate per axis before it
    /// becomes an Euler increment. `accel_scale`, when given, does the same
    /// for acceleration.
    pub fn tick(&mut self, dt: f32, gyro_scale: Vec3, accel_scale: Option<Vec3>) {
        if self.policy == IntegrationPolicy::GyroIntegration {
            if let Some(gyro) = self.latest_gyro {
                let step = quat_from_euler_degrees(gyro * gyro_scale);
                // Right-multiplied: the increment is in the device frame.
                self.state.rotation = (self.state.rotation * step).normalize();
            }
        }

        if let Some(accel) = self.latest_accel {
            let accel = accel_scale.map_or(accel, |scale| accel * scale);
            self.state.velocity += accel * dt;
            self.state.position += self.state.velocity * self.speed_multiplier * dt;
        }
    }

    pub fn reset_rotation(&mut self) {
        self.state.rotation = Quat::IDENTITY;
        tracing::info!("Rotation reset to identity");
    }

    pub fn lock_to_reference(&mut self) {
        self.state.rotation = self.reference_rotation;
        tracing::info!(reference = ?self.reference_rotation, "Rotation locked to reference");
    }

    pub fn reset_motion(&mut self) {
        self.state.velocity = Vec3::ZERO;
        self.state.position = Vec3::ZERO;
        tracing::info!("Velocity and position reset");
    }

    /// Forget latched samples, e.g. when their sender disconnects.
    pub fn clear_inputs(&mut self) {
        self.latest_accel = None;
        self.latest_gyro = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_PI_2, PI};

    fn gyro_frame(gyro: Vec3) -> SensorFrame {
        SensorFrame::SixAxis {
            accel: Vec3::ZERO,
            gyro,
        }
    }

    fn assert_same_rotation(a: Quat, b: Quat) {
        // q and -q describe the same rotation.
        assert!(a.dot(b).abs() > 1.0 - 1e-5, "{a:?} != {b:?}");
    }

    #[test]
    fn quarter_turn_about_y() {
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::GyroIntegration, 1.0, Quat::IDENTITY);
        integrator.ingest(&gyro_frame(Vec3::new(0.0, 90.0, 0.0)));
        integrator.tick(1.0 / 60.0, Vec3::ONE, None);
        assert_same_rotation(integrator.rotation(), Quat::from_rotation_y(FRAC_PI_2));

        integrator.tick(1.0 / 60.0, Vec3::ONE, None);
        assert_same_rotation(integrator.rotation(), Quat::from_rotation_y(PI));
    }

    #[test]
    fn increments_compose_on_the_right() {
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::GyroIntegration, 1.0, Quat::IDENTITY);
        integrator.ingest(&gyro_frame(Vec3::new(90.0, 0.0, 0.0)));
        integrator.tick(0.01, Vec3::ONE, None);
        integrator.ingest(&gyro_frame(Vec3::new(0.0, 90.0, 0.0)));
        integrator.tick(0.01, Vec3::ONE, None);

        let rx = Quat::from_rotation_x(FRAC_PI_2);
        let ry = Quat::from_rotation_y(FRAC_PI_2);
        assert_same_rotation(integrator.rotation(), rx * ry);
        assert!((integrator.rotation().dot(ry * rx)).abs() < 0.99);
    }

    #[test]
    fn gyro_scale_is_applied_per_axis() {
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::GyroIntegration, 1.0, Quat::IDENTITY);
        integrator.ingest(&gyro_frame(Vec3::new(0.0, 0.0, 900.0)));
        integrator.tick(0.01, Vec3::new(1.0, 1.0, 0.1), None);
        assert_same_rotation(integrator.rotation(), Quat::from_rotation_z(FRAC_PI_2));
    }

    #[test]
    fn quaternion_direct_takes_sender_orientation() {
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::QuaternionDirect, 1.0, Quat::IDENTITY);
        let quat = Quat::from_xyzw(0.0, 0.0, 0.6, 0.8);
        integrator.ingest(&SensorFrame::SevenField {
            accel: Vec3::ZERO,
            quat,
        });
        assert_eq!(integrator.rotation(), quat);

        // Ticks never integrate rotation in this mode.
        integrator.ingest(&gyro_frame(Vec3::new(0.0, 90.0, 0.0)));
        integrator.tick(0.1, Vec3::ONE, None);
        assert_eq!(integrator.rotation(), quat);
    }

    #[test]
    fn constant_acceleration_double_integrates() {
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::GyroIntegration, 2.0, Quat::IDENTITY);
        integrator.ingest(&SensorFrame::SixAxis {
            accel: Vec3::new(0.0, 0.0, 9.8),
            gyro: Vec3::ZERO,
        });

        let dt = 0.5;
        integrator.tick(dt, Vec3::ONE, None);
        integrator.tick(dt, Vec3::ONE, None);

        let state = integrator.state();
        // v = 9.8 * 0.5 * 2; p = 2 * 0.5 * (4.9 + 9.8)
        assert!((state.velocity.z - 9.8).abs() < 1e-5);
        assert!((state.position.z - 14.7).abs() < 1e-4);
        assert_eq!(state.rotation, Quat::IDENTITY);
    }

    #[test]
    fn accel_scale_multiplies_acceleration() {
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::GyroIntegration, 1.0, Quat::IDENTITY);
        integrator.ingest(&SensorFrame::TextTriple {
            accel: Vec3::new(10.0, 10.0, 10.0),
        });
        integrator.tick(1.0, Vec3::ONE, Some(Vec3::new(0.1, 0.2, 0.0)));
        let v = integrator.state().velocity;
        assert!((v.x - 1.0).abs() < 1e-6);
        assert!((v.y - 2.0).abs() < 1e-6);
        assert_eq!(v.z, 0.0);
    }

    #[test]
    fn operator_commands() {
        let reference = Quat::from_rotation_x(-FRAC_PI_2);
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::GyroIntegration, 1.0, reference);
        integrator.ingest(&gyro_frame(Vec3::new(10.0, 20.0, 30.0)));
        integrator.tick(0.1, Vec3::ONE, None);
        assert_ne!(integrator.rotation(), Quat::IDENTITY);

        integrator.lock_to_reference();
        assert_eq!(integrator.rotation(), reference);
        integrator.reset_rotation();
        assert_eq!(integrator.rotation(), Quat::IDENTITY);
    }

    #[test]
    fn cleared_inputs_stop_integration() {
        let mut integrator =
            OrientationIntegrator::new(IntegrationPolicy::GyroIntegration, 1.0, Quat::IDENTITY);
        integrator.ingest(&SensorFrame::SixAxis {
            accel: Vec3::X,
            gyro: Vec3::new(0.0, 45.0, 0.0),
        });
        integrator.tick(0.1, Vec3::ONE, None);
        let before = integrator.state();

        integrator.clear_inputs();
        integrator.tick(0.1, Vec3::ONE, None);
        let after = integrator.state();
        assert_eq!(before.rotation, after.rotation);
        assert_eq!(before.velocity, after.velocity);
        assert_eq!(before.position, after.position);
    }
}
