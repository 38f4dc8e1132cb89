use crate::hub::{SensorHub, SessionId};
use crate::protocol::FrameAssembler;
use crate::rate::RateMonitor;
use crate::types::WireFormat;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const READ_BUFFER_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Why a session loop ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    Shutdown,
}

enum Event {
    Read(std::io::Result<usize>),
    Shutdown,
}

/// One accepted sender: read, reassemble, decode, route.
pub struct ConnectionSession {
    id: SessionId,
    peer: SocketAddr,
    assembler: FrameAssembler,
    rate_window: Duration,
    /// Started on the first decoded frame.
    rate: Option<RateMonitor>,
    last_read: Option<Instant>,
    connected: bool,
    hub: Arc<SensorHub>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionSession {
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        format: WireFormat,
        rate_window: Duration,
        hub: Arc<SensorHub>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            peer,
            assembler: FrameAssembler::new(format),
            rate_window,
            rate: None,
            last_read: None,
            connected: true,
            hub,
            shutdown,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_read(&self) -> Option<Instant> {
        self.last_read
    }

    /// Drive the connection until the peer leaves, the transport fails, or
    /// the listener signals shutdown. The socket is closed exactly once on
    /// every path out.
    pub async fn run(mut self, mut stream: TcpStream) -> Result<SessionEnd, SessionError> {
        tracing::info!(
            session = self.id,
            peer = %self.peer,
            format = ?self.assembler.format(),
            "Client connected"
        );

        let result = self.read_loop(&mut stream).await;

        self.connected = false;
        if let Err(e) = stream.shutdown().await {
            tracing::debug!(session = self.id, ?e, "Socket shutdown failed");
        }
        drop(stream);
        self.hub.close_session(self.id);

        match &result {
            Ok(end) => tracing::info!(session = self.id, peer = %self.peer, ?end, "Client disconnected"),
            Err(e) => tracing::error!(session = self.id, peer = %self.peer, %e, "Session ended with error"),
        }
        result
    }

    async fn read_loop(&mut self, stream: &mut TcpStream) -> Result<SessionEnd, SessionError> {
        let mut buf = [0u8; READ_BUFFER_LEN];

        loop {
            if *self.shutdown.borrow() {
                return Ok(SessionEnd::Shutdown);
            }

            let event = tokio::select! {
                result = stream.read(&mut buf) => Event::Read(result),
                changed = self.shutdown.changed() => match changed {
                    Ok(()) if !*self.shutdown.borrow() => continue,
                    _ => Event::Shutdown,
                },
            };

            match event {
                Event::Read(Ok(0)) => return Ok(SessionEnd::Disconnected),
                Event::Read(Ok(n)) => self.handle_bytes(&buf[..n], Instant::now()),
                Event::Read(Err(e)) => return Err(SessionError::Transport(e)),
                Event::Shutdown => return Ok(SessionEnd::Shutdown),
            }
        }
    }

    fn handle_bytes(&mut self, data: &[u8], now: Instant) {
        self.last_read = Some(now);
        self.assembler.push_data(data);

        while let Some(decoded) = self.assembler.next_frame() {
            match decoded {
                Ok(frame) => {
                    let window = self.rate_window;
                    self.rate
                        .get_or_insert_with(|| RateMonitor::with_window(now, window))
                        .record_sample(now);
                    tracing::trace!(session = self.id, ?frame, "Frame decoded");
                    self.hub.accept_frame(self.id, &frame);
                }
                Err(e) => {
                    tracing::warn!(session = self.id, %e, "Dropping malformed frame");
                    self.hub.reject_frame(self.id, &e);
                }
            }
        }

        if let Some(hz) = self.rate.as_mut().and_then(|rate| rate.maybe_flush(now)) {
            tracing::info!(session = self.id, frequency_hz = hz, "Data frequency");
            self.hub.report_frequency(self.id, hz);
        }
    }
}
