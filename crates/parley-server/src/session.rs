//! One authenticated WebSocket connection.
//!
//! A session is split into two tasks. The reader decodes frames and runs
//! handlers; the writer is the only task that writes to the socket and
//! drains the outbound queue the hub feeds. When either side stops the
//! session unregisters exactly once, which closes the queue and lets the
//! writer send a close frame and exit.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parley_shared::constants::{OUTBOUND_QUEUE_CAPACITY, PING_INTERVAL, READ_TIMEOUT, WRITE_TIMEOUT};
use parley_shared::protocol::{ClientFrame, Event};
use parley_shared::types::UserId;
use parley_store::Store;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers::{HandlerContext, HandlerError};
use crate::hub::{HubHandle, SessionHandle};

/// Keep-alive and queue settings for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest silence tolerated from the client (any frame or pong resets it).
    pub read_timeout: Duration,
    /// Interval between server pings; must stay below `read_timeout`.
    pub ping_interval: Duration,
    /// Deadline for a single socket write.
    pub write_timeout: Duration,
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            ping_interval: PING_INTERVAL,
            write_timeout: WRITE_TIMEOUT,
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

/// Why the reader stopped.
#[derive(Debug)]
enum ReadEnd {
    IdleTimeout,
    ClientClosed,
    Disconnected,
    Transport,
}

pub struct Session {
    ctx: HandlerContext,
    config: SessionConfig,
}

impl Session {
    pub fn new(user_id: UserId, hub: HubHandle, store: Store, config: SessionConfig) -> Self {
        Self {
            ctx: HandlerContext::new(user_id, hub, store),
            config,
        }
    }

    /// Drive the connection until either half stops.
    pub async fn run(self, socket: WebSocket) {
        let user_id = self.ctx.user_id;
        let (handle, outbound) = SessionHandle::new(user_id, self.config.outbound_capacity);
        let session_id = handle.session_id;

        if let Err(e) = self.ctx.hub.register(handle).await {
            warn!(user_id = %user_id, error = %e, "Could not register session");
            return;
        }
        info!(user_id = %user_id, session_id = %session_id, "Session opened");

        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(write_pump(
            sink,
            outbound,
            self.config.clone(),
            user_id,
            session_id,
        ));

        let writer_done = tokio::select! {
            end = self.read_pump(stream) => {
                debug!(user_id = %user_id, session_id = %session_id, reason = ?end, "Reader stopped");
                false
            }
            _ = &mut writer => {
                debug!(user_id = %user_id, session_id = %session_id, "Writer stopped");
                true
            }
        };

        self.ctx.hub.unregister(user_id, session_id).await;

        // The queue is closed now (or was already, if we were replaced);
        // the writer flushes a close frame and exits on its own.
        if !writer_done && timeout(self.config.write_timeout, &mut writer).await.is_err() {
            writer.abort();
        }

        info!(user_id = %user_id, session_id = %session_id, "Session closed");
    }

    async fn read_pump(&self, mut stream: SplitStream<WebSocket>) -> ReadEnd {
        let mut deadline = Instant::now() + self.config.read_timeout;

        loop {
            let message = match timeout_at(deadline, stream.next()).await {
                Err(_) => return ReadEnd::IdleTimeout,
                Ok(None) => return ReadEnd::Disconnected,
                Ok(Some(Err(e))) => {
                    debug!(user_id = %self.ctx.user_id, error = %e, "Read failed");
                    return ReadEnd::Transport;
                }
                Ok(Some(Ok(message))) => message,
            };
            deadline = Instant::now() + self.config.read_timeout;

            match message {
                Message::Text(text) => self.on_text(text.as_str()).await,
                Message::Binary(_) => {
                    debug!(user_id = %self.ctx.user_id, "Ignoring binary frame");
                }
                // Pings are answered by the transport; either way the peer is alive.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => return ReadEnd::ClientClosed,
            }
        }
    }

    async fn on_text(&self, text: &str) {
        let user_id = self.ctx.user_id;

        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "Dropping malformed frame");
                return;
            }
        };
        let kind = frame.kind();

        match self.ctx.handle(frame).await {
            Ok(()) => {}
            Err(e @ (HandlerError::Rejected(_) | HandlerError::Forbidden(_))) => {
                debug!(user_id = %user_id, kind, error = %e, "Frame ignored");
            }
            Err(e @ (HandlerError::Store(_) | HandlerError::Blocking(_))) => {
                warn!(user_id = %user_id, kind, error = %e, "Store failure, frame dropped");
            }
            Err(e @ HandlerError::HubClosed(_)) => {
                warn!(user_id = %user_id, kind, error = %e, "Hub unavailable, frame dropped");
            }
        }
    }
}

/// Ping ticker, first tick one period from now. A stalled write must not be
/// followed by a burst of catch-up pings.
fn heartbeat(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Event>,
    config: SessionConfig,
    user_id: UserId,
    session_id: Uuid,
) {
    let mut pings = heartbeat(config.ping_interval);

    loop {
        let frame = tokio::select! {
            event = outbound.recv() => match event {
                Some(event) => match event.encode() {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        warn!(user_id = %user_id, kind = event.kind(), error = %e, "Could not encode event");
                        continue;
                    }
                },
                None => {
                    // Unregistered or replaced by a newer session.
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    }));
                    let _ = timeout(config.write_timeout, sink.send(close)).await;
                    return;
                }
            },
            _ = pings.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(config.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(user_id = %user_id, session_id = %session_id, error = %e, "Write failed");
                return;
            }
            Err(_) => {
                debug!(user_id = %user_id, session_id = %session_id, "Write deadline exceeded");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keepalive() {
        let config = SessionConfig::default();
        assert!(config.ping_interval < config.read_timeout);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_does_not_burst_after_a_stall() {
        let period = Duration::from_millis(100);
        let mut ticker = heartbeat(period);

        // Writer blocked for several periods.
        tokio::time::sleep(period * 5).await;
        ticker.tick().await;

        let before = Instant::now();
        ticker.tick().await;
        assert!(before.elapsed() >= period);
    }
}
