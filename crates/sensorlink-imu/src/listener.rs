use crate::hub::SensorHub;
use crate::session::ConnectionSession;
use crate::types::WireFormat;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Back-off after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

/// Per-listener session parameters.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub format: WireFormat,
    pub rate_window: Duration,
}

pub struct Listener;

impl Listener {
    /// Bind `addr` and start accepting in the background.
    pub async fn start(
        addr: &str,
        settings: SessionSettings,
        hub: Arc<SensorHub>,
    ) -> Result<ListenerHandle, BindError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| BindError {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| BindError {
            addr: addr.to_string(),
            source,
        })?;

        tracing::info!(%local_addr, format = ?settings.format, "Server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, settings, hub, shutdown_rx));

        Ok(ListenerHandle {
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Owns a running accept loop. Dropping it signals shutdown without waiting.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal every session, release the port, and wait for all of them to
    /// close. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.shutdown_tx.send_replace(true);
        if let Err(e) = task.await {
            tracing::error!(?e, "Accept loop panicked");
        }
        tracing::info!(local_addr = %self.local_addr, "Server stopped");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

enum AcceptEvent {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Reaped(Result<(), tokio::task::JoinError>),
    Shutdown,
}

async fn accept_loop(
    listener: TcpListener,
    settings: SessionSettings,
    hub: Arc<SensorHub>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        let event = tokio::select! {
            accepted = listener.accept() => AcceptEvent::Accepted(accepted),
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => AcceptEvent::Reaped(joined),
            changed = shutdown.changed() => match changed {
                Ok(()) if !*shutdown.borrow() => continue,
                _ => AcceptEvent::Shutdown,
            },
        };

        match event {
            AcceptEvent::Accepted(Ok((mut stream, peer))) => {
                let Some(id) = hub.open_session() else {
                    tracing::warn!(%peer, "Refusing connection: a sender is already active");
                    if let Err(e) = stream.shutdown().await {
                        tracing::debug!(%peer, ?e, "Refused socket shutdown failed");
                    }
                    continue;
                };
                let session = ConnectionSession::new(
                    id,
                    peer,
                    settings.format,
                    settings.rate_window,
                    Arc::clone(&hub),
                    shutdown.clone(),
                );
                sessions.spawn(async move {
                    let _ = session.run(stream).await;
                });
            }
            AcceptEvent::Accepted(Err(e)) => {
                tracing::warn!(%e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            AcceptEvent::Reaped(Ok(())) => {}
            AcceptEvent::Reaped(Err(e)) => tracing::error!(?e, "Session task panicked"),
            AcceptEvent::Shutdown => break,
        }
    }

    // Release the port before waiting on sessions.
    drop(listener);
    tracing::debug!(remaining = sessions.len(), "Listener closed, draining sessions");
    while let Some(joined) = sessions.join_next().await {
        if let Err(e) = joined {
            tracing::error!(?e, "Session task panicked");
        }
    }
}
