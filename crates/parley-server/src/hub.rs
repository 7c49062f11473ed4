//! The hub: sole owner of the `user -> session` registry and the single
//! serialization point for every cross-session delivery.
//!
//! Sessions and HTTP handlers talk to the hub through a cloneable
//! [`HubHandle`]. The [`Hub`] itself runs one control loop that multiplexes
//! register, unregister and broadcast requests, so fanout order is simply
//! the order events arrive on the broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;

use parley_shared::protocol::{Event, StatusUpdate};
use parley_shared::types::{MessageStatus, UserId};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Register/unregister are rendezvous-style: tokio has no zero-capacity
/// channel, so a single slot plus an acknowledgement stands in for one.
const CONTROL_CAPACITY: usize = 1;

#[derive(Debug, Error)]
#[error("hub is not running")]
pub struct HubClosed;

/// The hub's view of a live session.
///
/// Deliberately not `Clone`: the registry entry holds the only sender of the
/// session's outbound queue, so removing (or replacing) the entry is what
/// closes the queue.
#[derive(Debug)]
pub struct SessionHandle {
    pub user_id: UserId,
    /// Identity token distinguishing successive sessions of the same user.
    pub session_id: Uuid,
    outbound: mpsc::Sender<Event>,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its bounded outbound queue.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            user_id,
            session_id: Uuid::new_v4(),
            outbound,
        };
        (handle, rx)
    }

    /// Non-blocking enqueue. A full queue means the peer cannot keep up; the
    /// event is dropped for this recipient only.
    fn try_deliver(&self, event: Event) -> bool {
        match self.outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    user_id = %self.user_id,
                    session_id = %self.session_id,
                    kind = event.kind(),
                    "Outbound queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                debug!(
                    user_id = %self.user_id,
                    session_id = %self.session_id,
                    kind = event.kind(),
                    "Session writer gone, dropping event"
                );
                false
            }
        }
    }
}

struct Registration {
    handle: SessionHandle,
    ack: oneshot::Sender<()>,
}

struct Unregistration {
    user_id: UserId,
    session_id: Uuid,
}

type Registry = Arc<RwLock<HashMap<UserId, SessionHandle>>>;

/// Cloneable entry point used by sessions and HTTP handlers.
#[derive(Clone)]
pub struct HubHandle {
    clients: Registry,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Unregistration>,
    broadcast_tx: mpsc::Sender<Event>,
}

impl HubHandle {
    /// Insert a session into the registry, replacing any previous session of
    /// the same user. Returns once the hub has applied the change.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.register_tx
            .send(Registration { handle, ack })
            .await
            .map_err(|_| HubClosed)?;
        done.await.map_err(|_| HubClosed)
    }

    /// Remove the session if it is still the registered one for `user_id`.
    pub async fn unregister(&self, user_id: UserId, session_id: Uuid) {
        let request = Unregistration {
            user_id,
            session_id,
        };
        if self.unregister_tx.send(request).await.is_err() {
            debug!(user_id = %user_id, "Hub already stopped; nothing to unregister");
        }
    }

    /// Queue an event for dispatch. This is the only path into fanout.
    pub async fn broadcast(&self, event: Event) -> Result<(), HubClosed> {
        self.broadcast_tx.send(event).await.map_err(|_| HubClosed)
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.clients.read().await.contains_key(&user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

pub struct Hub {
    clients: Registry,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Unregistration>,
    broadcast_rx: mpsc::Receiver<Event>,
}

impl Hub {
    pub fn new(broadcast_capacity: usize) -> (Self, HubHandle) {
        let clients: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_capacity.max(1));

        let hub = Self {
            clients: clients.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        let handle = HubHandle {
            clients,
            register_tx,
            unregister_tx,
            broadcast_tx,
        };
        (hub, handle)
    }

    /// Build a hub and run its loop on a background task.
    pub fn spawn(broadcast_capacity: usize) -> HubHandle {
        let (hub, handle) = Self::new(broadcast_capacity);
        tokio::spawn(hub.run());
        handle
    }

    /// Control loop. Exits once every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                Some(registration) = self.register_rx.recv() => {
                    self.register(registration).await;
                }
                Some(request) = self.unregister_rx.recv() => {
                    self.unregister(request).await;
                }
                Some(event) = self.broadcast_rx.recv() => {
                    self.dispatch(event).await;
                }
                else => break,
            }
        }

        info!("Hub stopped");
    }

    async fn register(&self, registration: Registration) {
        let Registration { handle, ack } = registration;
        let user_id = handle.user_id;
        let session_id = handle.session_id;

        let mut clients = self.clients.write().await;
        if let Some(previous) = clients.insert(user_id, handle) {
            info!(
                user_id = %user_id,
                replaced = %previous.session_id,
                session_id = %session_id,
                "Replacing existing session"
            );
            // Dropping the old handle closes its queue while the lock is held.
            drop(previous);
        }
        let online = clients.len();
        drop(clients);

        let _ = ack.send(());
        debug!(user_id = %user_id, session_id = %session_id, online, "Session registered");
    }

    async fn unregister(&self, request: Unregistration) {
        let mut clients = self.clients.write().await;
        let is_current = clients
            .get(&request.user_id)
            .is_some_and(|current| current.session_id == request.session_id);

        if is_current {
            clients.remove(&request.user_id);
            debug!(
                user_id = %request.user_id,
                session_id = %request.session_id,
                online = clients.len(),
                "Session unregistered"
            );
        } else {
            debug!(
                user_id = %request.user_id,
                session_id = %request.session_id,
                "Ignoring unregister for a session that was already replaced"
            );
        }
    }

    async fn dispatch(&self, event: Event) {
        let clients = self.clients.read().await;

        match &event {
            Event::Message(message) => {
                let receiver = (message.receiver_id != message.sender_id)
                    .then(|| clients.get(&message.receiver_id))
                    .flatten();
                let delivered = receiver.is_some_and(|session| session.try_deliver(event.clone()));

                // The author always gets the canonical copy (with its id).
                if let Some(sender) = clients.get(&message.sender_id) {
                    sender.try_deliver(event.clone());
                    if delivered {
                        sender.try_deliver(Event::StatusUpdate(StatusUpdate {
                            message_id: message.message_id,
                            status: MessageStatus::Delivered,
                            sender_id: message.sender_id,
                            receiver_id: message.receiver_id,
                        }));
                    }
                }
            }
            Event::StatusUpdate(update) => {
                if let Some(sender) = clients.get(&update.sender_id) {
                    sender.try_deliver(event.clone());
                }
                if update.receiver_id != update.sender_id {
                    if let Some(receiver) = clients.get(&update.receiver_id) {
                        receiver.try_deliver(event.clone());
                    }
                }
            }
            Event::CallOffer(_)
            | Event::CallAnswer(_)
            | Event::IceCandidate(_)
            | Event::CallReject(_)
            | Event::CallHangup(_) => match clients.get(&event.receiver_id()) {
                Some(receiver) => {
                    receiver.try_deliver(event.clone());
                }
                None => debug!(
                    receiver_id = %event.receiver_id(),
                    kind = event.kind(),
                    "Signal target offline, dropping"
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use parley_shared::protocol::{MessageEvent, SignalEvent, SignalKind};
    use parley_shared::types::MessageId;
    use serde_json::json;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const CAROL: UserId = UserId(3);

    async fn connect(hub: &HubHandle, user: UserId, capacity: usize) -> (Uuid, mpsc::Receiver<Event>) {
        let (handle, rx) = SessionHandle::new(user, capacity);
        let id = handle.session_id;
        hub.register(handle).await.unwrap();
        (id, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("queue closed")
    }

    async fn assert_silent(rx: &mut mpsc::Receiver<Event>) {
        let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(res.is_err(), "unexpected event: {:?}", res);
    }

    fn message(id: i64, from: UserId, to: UserId) -> Event {
        Event::Message(MessageEvent {
            message_id: MessageId(id),
            sender_id: from,
            receiver_id: to,
            content: "hi".into(),
            status: MessageStatus::Sent,
            created_at: Utc::now(),
            client_message_id: Some("c-1".into()),
            file_name: None,
            file_url: None,
            file_content_type: None,
            encrypted: false,
            envelope: None,
        })
    }

    fn offer(from: UserId, to: UserId) -> Event {
        Event::signal(
            SignalKind::CallOffer,
            SignalEvent {
                sender_id: from,
                receiver_id: to,
                payload: json!({"sdp": "v=0"}),
            },
        )
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let hub = Hub::spawn(16);
        let (id, _rx) = connect(&hub, ALICE, 8).await;
        assert!(hub.is_online(ALICE).await);
        assert!(!hub.is_online(BOB).await);

        hub.unregister(ALICE, id).await;
        // A round trip through the loop orders us after the unregister.
        let (_, _bob) = connect(&hub, BOB, 8).await;
        assert!(!hub.is_online(ALICE).await);
        assert_eq!(hub.online_count().await, 1);
    }

    #[tokio::test]
    async fn message_reaches_both_and_sender_learns_delivery() {
        let hub = Hub::spawn(16);
        let (_, mut alice) = connect(&hub, ALICE, 8).await;
        let (_, mut bob) = connect(&hub, BOB, 8).await;

        hub.broadcast(message(7, ALICE, BOB)).await.unwrap();

        assert!(matches!(next(&mut bob).await, Event::Message(m) if m.message_id == MessageId(7)));
        assert!(matches!(next(&mut alice).await, Event::Message(m) if m.message_id == MessageId(7)));
        match next(&mut alice).await {
            Event::StatusUpdate(update) => {
                assert_eq!(update.message_id, MessageId(7));
                assert_eq!(update.status, MessageStatus::Delivered);
                assert_eq!(update.sender_id, ALICE);
                assert_eq!(update.receiver_id, BOB);
            }
            other => panic!("expected status update, got {other:?}"),
        }
        assert_silent(&mut bob).await;
    }

    #[tokio::test]
    async fn offline_receiver_gets_no_delivered_receipt() {
        let hub = Hub::spawn(16);
        let (_, mut alice) = connect(&hub, ALICE, 8).await;

        hub.broadcast(message(1, ALICE, BOB)).await.unwrap();

        assert!(matches!(next(&mut alice).await, Event::Message(_)));
        assert_silent(&mut alice).await;
    }

    #[tokio::test]
    async fn status_update_goes_to_both_parties() {
        let hub = Hub::spawn(16);
        let (_, mut alice) = connect(&hub, ALICE, 8).await;
        let (_, mut bob) = connect(&hub, BOB, 8).await;

        let update = Event::StatusUpdate(StatusUpdate {
            message_id: MessageId(3),
            status: MessageStatus::Read,
            sender_id: ALICE,
            receiver_id: BOB,
        });
        hub.broadcast(update.clone()).await.unwrap();

        assert_eq!(next(&mut alice).await, update);
        assert_eq!(next(&mut bob).await, update);
    }

    #[tokio::test]
    async fn signals_only_reach_the_receiver() {
        let hub = Hub::spawn(16);
        let (_, mut alice) = connect(&hub, ALICE, 8).await;
        let (_, mut bob) = connect(&hub, BOB, 8).await;

        hub.broadcast(offer(ALICE, BOB)).await.unwrap();

        match next(&mut bob).await {
            Event::CallOffer(signal) => {
                assert_eq!(signal.sender_id, ALICE);
                assert_eq!(signal.payload, json!({"sdp": "v=0"}));
            }
            other => panic!("expected call offer, got {other:?}"),
        }
        assert_silent(&mut alice).await;
    }

    #[tokio::test]
    async fn reconnect_replaces_and_closes_previous_session() {
        let hub = Hub::spawn(16);
        let (first_id, mut first) = connect(&hub, ALICE, 8).await;
        let (second_id, mut second) = connect(&hub, ALICE, 8).await;

        // The old queue is closed by the replacement.
        assert!(first.recv().await.is_none());

        // A late unregister from the old session must not evict the new one.
        hub.unregister(ALICE, first_id).await;
        let (_, _bob) = connect(&hub, BOB, 8).await;
        assert!(hub.is_online(ALICE).await);

        hub.broadcast(offer(BOB, ALICE)).await.unwrap();
        assert!(matches!(next(&mut second).await, Event::CallOffer(_)));

        hub.unregister(ALICE, second_id).await;
        assert!(second.recv().await.is_none());
        assert!(!hub.is_online(ALICE).await);
    }

    #[tokio::test]
    async fn full_queue_drops_without_stalling_the_hub() {
        let hub = Hub::spawn(16);
        let (_, mut alice) = connect(&hub, ALICE, 8).await;
        let (_, mut bob) = connect(&hub, BOB, 1).await;
        let (_, mut carol) = connect(&hub, CAROL, 8).await;

        // Bob never reads: one offer fills his single slot.
        hub.broadcast(offer(CAROL, BOB)).await.unwrap();
        hub.broadcast(message(9, ALICE, BOB)).await.unwrap();
        hub.broadcast(offer(ALICE, CAROL)).await.unwrap();

        // Hub kept going for other users.
        assert!(matches!(next(&mut carol).await, Event::CallOffer(_)));

        // Alice got her echo but no delivered receipt, since Bob's copy was dropped.
        assert!(matches!(next(&mut alice).await, Event::Message(m) if m.message_id == MessageId(9)));
        assert_silent(&mut alice).await;

        // Bob only holds the event that filled his queue.
        assert!(matches!(next(&mut bob).await, Event::CallOffer(_)));
        assert_silent(&mut bob).await;
    }

    #[tokio::test]
    async fn hub_stops_when_handles_drop() {
        let (hub, handle) = Hub::new(4);
        let task = tokio::spawn(hub.run());
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("hub loop should exit")
            .unwrap();
    }
}
