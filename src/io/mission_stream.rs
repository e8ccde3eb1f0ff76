//! Completed-mission websocket stream
//!
//! Keeps one connection open to the backend's completed-mission endpoint and
//! feeds every decoded mission through the classification pipeline. Each
//! message is fully processed before the next frame is read. Connection
//! faults are retried forever after a fixed delay.

use crate::domain::mission::CompletedFlowControlMission;
use crate::infra::metrics::{
    Metrics, STREAM_STATE_CONNECTED, STREAM_STATE_CONNECTING, STREAM_STATE_RECONNECTING,
};
use crate::services::pipeline::ClassificationPipeline;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// Delay between a connection fault and the next attempt
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed
    Established,
    /// Connect attempt failed
    Failed,
    /// Close frame, receive error or end of stream on a live session
    SessionEnded,
    /// Reconnect delay has passed
    RetryElapsed,
}

impl ConnectionState {
    pub fn next(self, event: ConnectionEvent) -> Self {
        match (self, event) {
            (ConnectionState::Connecting, ConnectionEvent::Established) => ConnectionState::Connected,
            (ConnectionState::Connecting, ConnectionEvent::Failed) => ConnectionState::Reconnecting,
            (ConnectionState::Connected, ConnectionEvent::SessionEnded) => {
                ConnectionState::Reconnecting
            }
            (ConnectionState::Reconnecting, ConnectionEvent::RetryElapsed) => {
                ConnectionState::Connecting
            }
            (state, _) => state,
        }
    }

    /// Value exported on the stream state gauge
    pub fn as_gauge(self) -> u64 {
        match self {
            ConnectionState::Connecting => STREAM_STATE_CONNECTING,
            ConnectionState::Connected => STREAM_STATE_CONNECTED,
            ConnectionState::Reconnecting => STREAM_STATE_RECONNECTING,
        }
    }
}

/// Reconnect delay as a function of the attempt number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Constant: no growth, no cap on attempts
    pub fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(RECONNECT_DELAY)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    #[error("invalid completed mission: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse one completed-mission message, running mission validation
pub fn decode_mission(payload: &str) -> Result<CompletedFlowControlMission, DecodeError> {
    Ok(serde_json::from_str(payload)?)
}

/// Why a connected session stopped reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Closed(Option<String>),
    Error(String),
    Exhausted,
    Shutdown,
}

pub struct MissionStream {
    url: String,
    policy: ReconnectPolicy,
    pipeline: Arc<ClassificationPipeline>,
    metrics: Arc<Metrics>,
}

impl MissionStream {
    pub fn new(url: String, pipeline: Arc<ClassificationPipeline>, metrics: Arc<Metrics>) -> Self {
        Self { url, policy: ReconnectPolicy::default(), pipeline, metrics }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect, dispatch and reconnect until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut state = ConnectionState::Connecting;
        let mut attempt: u32 = 0;

        loop {
            self.publish(state);
            info!(url = %self.url, attempt = attempt, "mission_stream_connecting");

            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("mission_stream_shutdown");
                    return;
                }
            };

            match connected {
                Ok((ws_stream, _response)) => {
                    state = state.next(ConnectionEvent::Established);
                    self.publish(state);
                    attempt = 0;
                    info!(url = %self.url, "mission_stream_connected");

                    match self.dispatch(ws_stream, &mut shutdown).await {
                        SessionEnd::Shutdown => {
                            info!("mission_stream_shutdown");
                            return;
                        }
                        end => warn!(reason = ?end, "mission_stream_ended"),
                    }
                    state = state.next(ConnectionEvent::SessionEnded);
                }
                Err(e) => {
                    error!(url = %self.url, error = %e, "mission_stream_connect_failed");
                    state = state.next(ConnectionEvent::Failed);
                }
            }

            self.publish(state);
            self.metrics.record_reconnect();
            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("mission_stream_shutdown");
                    return;
                }
            }
            state = state.next(ConnectionEvent::RetryElapsed);
        }
    }

    /// Drain frames from one session, awaiting the pipeline per message
    pub async fn dispatch<S>(&self, mut frames: S, shutdown: &mut watch::Receiver<bool>) -> SessionEnd
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = shutdown.wait_for(|stop| *stop) => return SessionEnd::Shutdown,
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.handle_payload(&text).await,
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => self.handle_payload(text).await,
                    Err(_) => {
                        self.metrics.record_event_received();
                        self.reject(DecodeError::NotUtf8);
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Closed(frame.map(|f| f.reason.to_string()));
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return SessionEnd::Error(e.to_string()),
                None => return SessionEnd::Exhausted,
            }
        }
    }

    async fn handle_payload(&self, payload: &str) {
        self.metrics.record_event_received();

        let completed = match decode_mission(payload) {
            Ok(completed) => completed,
            Err(e) => {
                self.reject(e);
                return;
            }
        };

        let valve_id = completed.mission().valve_id();
        let started = Instant::now();

        match self.pipeline.process(completed).await {
            Ok(outcome) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_classification(outcome.record.predicted_end_use, latency_ms);
                if !outcome.persisted {
                    self.metrics.record_sink_failure();
                }
                info!(
                    valve_id = valve_id,
                    end_use = %outcome.record.predicted_end_use,
                    persisted = outcome.persisted,
                    latency_ms = latency_ms,
                    "mission_classified"
                );
            }
            Err(e) => {
                self.metrics.record_pipeline_failure();
                warn!(valve_id = valve_id, error = %e, "mission_classification_failed");
            }
        }
    }

    fn reject(&self, error: DecodeError) {
        self.metrics.record_decode_failure();
        warn!(error = %error, "mission_decode_failed");
    }

    fn publish(&self, state: ConnectionState) {
        debug!(state = ?state, "mission_stream_state");
        self.metrics.set_stream_state(state.as_gauge());
    }
}
