pub mod calibration;
pub mod fusion;
pub mod hub;
pub mod listener;
pub mod protocol;
pub mod rate;
pub mod session;
pub mod types;

use calibration::{AxisResult, CalibrationError};
use hub::SensorHub;
use listener::{BindError, Listener, ListenerHandle, SessionSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use types::WireFormat;

/// Where and how the server listens.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    pub format: WireFormat,
    pub rate_window: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 1234,
            format: WireFormat::Binary24,
            rate_window: rate::MIN_WINDOW,
        }
    }
}

/// Telemetry server plus the controls a presentation layer binds to.
///
/// Owns at most one listener. Sensor state lives in the shared
/// [`SensorHub`], which outlives start/stop cycles.
pub struct SensorServer {
    settings: ServerSettings,
    hub: Arc<SensorHub>,
    listener: Option<ListenerHandle>,
}

impl SensorServer {
    pub fn new(settings: ServerSettings, hub: Arc<SensorHub>) -> Self {
        Self {
            settings,
            hub,
            listener: None,
        }
    }

    pub fn hub(&self) -> &Arc<SensorHub> {
        &self.hub
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(ListenerHandle::local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.listener.as_ref().is_some_and(ListenerHandle::is_running)
    }

    /// Start listening. Already listening is not an error: the current
    /// address is returned and nothing is rebound.
    pub async fn start_server(&mut self) -> Result<SocketAddr, BindError> {
        if let Some(listener) = &self.listener {
            tracing::info!(local_addr = %listener.local_addr(), "Server already running");
            return Ok(listener.local_addr());
        }

        let addr = format!("{}:{}", self.settings.bind_address, self.settings.port);
        let session = SessionSettings {
            format: self.settings.format,
            rate_window: self.settings.rate_window,
        };
        let handle = Listener::start(&addr, session, Arc::clone(&self.hub)).await?;
        let local_addr = handle.local_addr();
        self.listener = Some(handle);
        Ok(local_addr)
    }

    /// Stop listening and close every session. Safe to call when stopped.
    pub async fn stop_server(&mut self) {
        match self.listener.take() {
            Some(mut listener) => listener.stop().await,
            None => tracing::debug!("Server not running, stop ignored"),
        }
    }

    pub fn begin_gyro_calibration(&self) -> bool {
        self.hub.begin_gyro_calibration()
    }

    pub fn start_gyro_calibration(&self) -> bool {
        self.hub.start_gyro_calibration()
    }

    pub fn stop_gyro_calibration(&self) -> Result<AxisResult, CalibrationError> {
        self.hub.stop_gyro_calibration()
    }

    pub fn begin_accel_calibration(&self) -> bool {
        self.hub.begin_accel_calibration()
    }

    pub fn start_accel_calibration(&self) -> bool {
        self.hub.start_accel_calibration()
    }

    pub fn stop_accel_calibration(&self) -> Result<AxisResult, CalibrationError> {
        self.hub.stop_accel_calibration()
    }

    pub fn reset_rotation(&self) {
        self.hub.reset_rotation();
    }

    pub fn lock_to_reference(&self) {
        self.hub.lock_to_reference();
    }

    pub fn reset_motion(&self) {
        self.hub.reset_motion();
    }
}
