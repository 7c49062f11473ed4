//! Per-frame handlers run on a session's reader task.
//!
//! Each handler validates the frame, performs at most one store call and
//! posts at most one event to the hub. Nothing here writes to a socket.

use parley_shared::protocol::{
    ClientFrame, Event, MessageEvent, OutgoingMessage, SignalEvent, SignalFrame, SignalKind,
    StatusUpdate,
};
use parley_shared::types::{MessageId, MessageStatus, UserId};
use parley_store::{NewMessage, Store, StoreError};
use thiserror::Error;

use crate::hub::{HubClosed, HubHandle};

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Frame failed field validation; dropped.
    #[error("rejected frame: {0}")]
    Rejected(&'static str),

    /// Wrong claimant or unknown message; ignored without a reply.
    #[error("status change not allowed: {0}")]
    Forbidden(#[source] StoreError),

    /// The store could not serve the request; the client may retry.
    #[error("store unavailable: {0}")]
    Store(#[source] StoreError),

    #[error("store task failed: {0}")]
    Blocking(String),

    #[error(transparent)]
    HubClosed(#[from] HubClosed),
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound | StoreError::NotReceiver => HandlerError::Forbidden(e),
            other => HandlerError::Store(other),
        }
    }
}

/// Everything a session's handlers need.
#[derive(Clone)]
pub struct HandlerContext {
    pub user_id: UserId,
    pub hub: HubHandle,
    pub store: Store,
}

impl HandlerContext {
    pub fn new(user_id: UserId, hub: HubHandle, store: Store) -> Self {
        Self {
            user_id,
            hub,
            store,
        }
    }

    /// Handle one decoded frame end to end.
    pub async fn handle(&self, frame: ClientFrame) -> Result<(), HandlerError> {
        let event = match frame {
            ClientFrame::Message(message) => Some(self.send_message(message).await?),
            ClientFrame::MarkDelivered(claim) => {
                self.advance(claim.message_id, MessageStatus::Delivered).await?
            }
            ClientFrame::MarkRead(claim) => {
                self.advance(claim.message_id, MessageStatus::Read).await?
            }
            ClientFrame::Signal(kind, signal) => Some(relay_signal(self.user_id, kind, signal)?),
        };

        if let Some(event) = event {
            self.hub.broadcast(event).await?;
        }
        Ok(())
    }

    async fn send_message(&self, outgoing: OutgoingMessage) -> Result<Event, HandlerError> {
        let (new_message, client_message_id) = validate_message(self.user_id, outgoing)?;

        let (new_message, inserted) = self
            .blocking(move |store| {
                let inserted = store.insert_message(&new_message)?;
                Ok((new_message, inserted))
            })
            .await?;

        Ok(Event::Message(MessageEvent {
            message_id: inserted.id,
            sender_id: new_message.sender_id,
            receiver_id: new_message.receiver_id,
            content: new_message.content,
            status: MessageStatus::Sent,
            created_at: inserted.created_at,
            client_message_id,
            file_name: None,
            file_url: None,
            file_content_type: None,
            encrypted: new_message.envelope.is_some(),
            envelope: new_message.envelope,
        }))
    }

    async fn advance(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Result<Option<Event>, HandlerError> {
        if !message_id.is_valid() {
            return Err(HandlerError::Rejected("message_id must be positive"));
        }

        let claimant = self.user_id;
        let change = self
            .blocking(move |store| match status {
                MessageStatus::Read => store.mark_read(message_id, claimant),
                _ => store.mark_delivered(message_id, claimant),
            })
            .await?;

        if !change.applied {
            tracing::debug!(
                message_id = %message_id,
                current = %change.status,
                requested = %status,
                "Status already reached, nothing to announce"
            );
            return Ok(None);
        }

        Ok(Some(Event::StatusUpdate(StatusUpdate {
            message_id: change.message_id,
            status: change.status,
            sender_id: change.sender_id,
            receiver_id: change.receiver_id,
        })))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, HandlerError>
    where
        F: FnOnce(&Store) -> parley_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| HandlerError::Blocking(e.to_string()))?
            .map_err(HandlerError::from)
    }
}

/// Check an inbound message and shape it for insertion. Returns the row to
/// insert and the echoed client message id.
pub fn validate_message(
    sender: UserId,
    outgoing: OutgoingMessage,
) -> Result<(NewMessage, Option<String>), HandlerError> {
    validate_receiver(sender, outgoing.receiver_id)?;

    let (content, envelope) = if outgoing.encrypted {
        let envelope = outgoing
            .envelope()
            .ok_or(HandlerError::Rejected("incomplete encryption envelope"))?;
        (String::new(), Some(envelope))
    } else {
        if outgoing.content.is_empty() {
            return Err(HandlerError::Rejected("content must not be empty"));
        }
        (outgoing.content, None)
    };

    let message = NewMessage {
        sender_id: sender,
        receiver_id: outgoing.receiver_id,
        content,
        envelope,
    };
    Ok((message, outgoing.client_message_id))
}

/// Turn a signaling frame into the event relayed to its receiver. The
/// payload is never inspected.
pub fn relay_signal(
    sender: UserId,
    kind: SignalKind,
    signal: SignalFrame,
) -> Result<Event, HandlerError> {
    validate_receiver(sender, signal.receiver_id)?;
    Ok(Event::signal(
        kind,
        SignalEvent {
            sender_id: sender,
            receiver_id: signal.receiver_id,
            payload: signal.payload,
        },
    ))
}

fn validate_receiver(sender: UserId, receiver: UserId) -> Result<(), HandlerError> {
    if !receiver.is_valid() {
        return Err(HandlerError::Rejected("receiver_id must be positive"));
    }
    if receiver == sender {
        return Err(HandlerError::Rejected("cannot address yourself"));
    }
    Ok(())
}
