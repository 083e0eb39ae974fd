//! Transport link management.
//!
//! Connects to the game feed, decodes frames with [`EventNormalizer`] and
//! forwards events plus lifecycle signals on a single ordered channel. The
//! link is re-established indefinitely with a fixed delay.
//!
//! When an established connection drops, a [`SupervisorSignal::ForceClose`]
//! follows the `Disconnected` signal so the in-flight session is finalized
//! instead of silently lost.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rugs_common::{CloseReason, Event};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, protocol::Message},
};
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_FEED_URL;
use crate::normalizer::{EventNormalizer, Frame, NAMESPACE_CONNECT_FRAME, PONG_FRAME};
use crate::stats::CollectorStats;

/// Errors that end a single connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Stream ended unexpectedly")]
    StreamEnded,
}

/// Configuration for the connection supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Feed URL.
    pub url: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Capacity of the signal channel to the pipeline.
    pub channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            reconnect_delay: Duration::from_secs(5),
            channel_capacity: 10_000,
        }
    }
}

/// What the supervisor tells the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorSignal {
    Connected,
    Disconnected(String),
    /// Consecutive attempt number since the last successful connect.
    Reconnecting(u32),
    Event(Event),
    /// Finalize the active session with this reason.
    ForceClose(CloseReason),
}

/// How a connection ended without error.
enum Stop {
    Shutdown,
    ConsumerGone,
}

/// Owns the transport link and its reconnect lifecycle.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    stats: Arc<CollectorStats>,
}

impl ConnectionSupervisor {
    pub fn new(config: SupervisorConfig, stats: Arc<CollectorStats>) -> Self {
        Self { config, stats }
    }

    /// Spawn the supervisor and return its signal stream.
    pub fn establish(
        self,
        shutdown: broadcast::Receiver<()>,
    ) -> (mpsc::Receiver<SupervisorSignal>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = tokio::spawn(async move { self.run(tx, shutdown).await });
        (rx, handle)
    }

    /// Runs the connect loop until shutdown or until the consumer goes away.
    pub async fn run(
        &self,
        signals: mpsc::Sender<SupervisorSignal>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.try_recv().is_ok() {
                info!("Supervisor: shutdown signal received");
                return;
            }

            if attempt > 0 {
                self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                if signals.send(SupervisorSignal::Reconnecting(attempt)).await.is_err() {
                    return;
                }
            }

            let mut connected = false;
            let result = self
                .run_connection(&signals, &mut shutdown, &mut connected)
                .await;
            self.stats.set_connected(false);

            match result {
                Ok(Stop::Shutdown) => {
                    info!("Supervisor: clean shutdown");
                    return;
                }
                Ok(Stop::ConsumerGone) => {
                    warn!("Supervisor: signal consumer dropped, stopping");
                    return;
                }
                Err(e) => {
                    if connected {
                        attempt = 0;
                        self.stats.connection_drops.fetch_add(1, Ordering::Relaxed);
                        let reason = e.to_string();
                        let sent = signals
                            .send(SupervisorSignal::Disconnected(reason))
                            .await
                            .is_ok()
                            && signals
                                .send(SupervisorSignal::ForceClose(CloseReason::Disconnected))
                                .await
                                .is_ok();
                        if !sent {
                            return;
                        }
                    }
                    attempt = attempt.saturating_add(1);

                    warn!(
                        "Feed connection error: {e}, reconnecting in {:?}",
                        self.config.reconnect_delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                        _ = shutdown.recv() => {
                            info!("Supervisor: shutdown during reconnect delay");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Runs a single WebSocket connection until error or shutdown.
    async fn run_connection(
        &self,
        signals: &mpsc::Sender<SupervisorSignal>,
        shutdown: &mut broadcast::Receiver<()>,
        connected: &mut bool,
    ) -> Result<Stop, TransportError> {
        info!("Connecting to feed at {}", self.config.url);

        let (ws_stream, _response) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        info!("Connected to feed");
        *connected = true;
        self.stats.set_connected(true);
        if signals.send(SupervisorSignal::Connected).await.is_err() {
            return Ok(Stop::ConsumerGone);
        }

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match EventNormalizer::normalize(text.as_str(), Utc::now()) {
                                Frame::Event(event) => {
                                    self.stats.mark_event(event.timestamp);
                                    if signals.send(SupervisorSignal::Event(event)).await.is_err() {
                                        return Ok(Stop::ConsumerGone);
                                    }
                                }
                                Frame::Ping => {
                                    write.send(Message::Text(PONG_FRAME.into())).await?;
                                }
                                Frame::Open => {
                                    debug!("Handshake received, joining namespace");
                                    write.send(Message::Text(NAMESPACE_CONNECT_FRAME.into())).await?;
                                }
                                Frame::Close => {
                                    info!("Feed closed the session");
                                    return Err(TransportError::StreamEnded);
                                }
                                Frame::Ignored => {}
                                Frame::Malformed => {
                                    self.stats.validation_errors.fetch_add(1, Ordering::Relaxed);
                                    debug!("Dropping undecodable frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("WebSocket closed by server: {:?}", frame);
                            return Err(TransportError::StreamEnded);
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {e}");
                            return Err(TransportError::WebSocket(e));
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return Err(TransportError::StreamEnded);
                        }
                        _ => {}
                    }
                }

                _ = shutdown.recv() => {
                    info!("Supervisor: shutdown signal received");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Stop::Shutdown);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config(url: String) -> SupervisorConfig {
        SupervisorConfig {
            url,
            reconnect_delay: Duration::from_millis(20),
            channel_capacity: 16,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<SupervisorSignal>) -> SupervisorSignal {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.url, DEFAULT_FEED_URL);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreachable_feed_keeps_retrying() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let stats = Arc::new(CollectorStats::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let supervisor = ConnectionSupervisor::new(fast_config(format!("ws://{addr}")), stats.clone());
        let (mut rx, handle) = supervisor.establish(shutdown_rx);

        assert_eq!(next(&mut rx).await, SupervisorSignal::Reconnecting(1));
        assert_eq!(next(&mut rx).await, SupervisorSignal::Reconnecting(2));

        shutdown_tx.send(()).unwrap();
        timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(stats.reconnect_attempts.load(Ordering::Relaxed) >= 2);
        assert_eq!(stats.connection_drops.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_session_then_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"0{"sid":"abc","pingInterval":25000}"#.into()))
                .await
                .unwrap();
            let join = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("2".into())).await.unwrap();
            let pong = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("not a frame".into())).await.unwrap();
            ws.send(Message::Text(
                r#"42["gameStateUpdate",{"gameId":"g1","tick":3,"price":1.2}]"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
            (join, pong)
        });

        let stats = Arc::new(CollectorStats::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let supervisor = ConnectionSupervisor::new(fast_config(format!("ws://{addr}")), stats.clone());
        let (mut rx, handle) = supervisor.establish(shutdown_rx);

        assert_eq!(next(&mut rx).await, SupervisorSignal::Connected);
        let SupervisorSignal::Event(event) = next(&mut rx).await else {
            panic!("expected event");
        };
        assert_eq!(event.game_id(), Some("g1"));
        assert!(matches!(next(&mut rx).await, SupervisorSignal::Disconnected(_)));
        assert_eq!(
            next(&mut rx).await,
            SupervisorSignal::ForceClose(CloseReason::Disconnected)
        );
        assert_eq!(next(&mut rx).await, SupervisorSignal::Reconnecting(1));

        let (join, pong) = server.await.unwrap();
        assert_eq!(join, Message::Text(NAMESPACE_CONNECT_FRAME.into()));
        assert_eq!(pong, Message::Text(PONG_FRAME.into()));

        shutdown_tx.send(()).unwrap();
        timeout(WAIT, handle).await.unwrap().unwrap();

        let counters = stats.counters();
        assert_eq!(counters.connection_drops, 1);
        assert_eq!(counters.events_received, 1);
        assert_eq!(counters.validation_errors, 1);
    }
}
