use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, MessageStatus, RecipientKey, UserId},
    protocol::{
        decode_client_envelope, ClientEnvelope, EnvelopeError, MessagePayload, ServerEnvelope,
    },
};
use storage::{MessageStore, NewMessage, StoredMessage};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    registry::ConnectionRegistry,
    writer::{ConnectionWriter, WriteError},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    /// Also push accepted status changes to the receiver's own connection.
    pub echo_status_to_receiver: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitMessage {
    pub receiver_id: UserId,
    pub content: String,
    pub keys: Vec<RecipientKey>,
    pub expires_at: String,
    pub attachments: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub message_id: MessageId,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Accepted {
        message_id: MessageId,
        status: MessageStatus,
    },
    Rejected(RejectReason),
}

impl TransitionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    NotReceiver,
    /// `sent` and `delivered` are never accepted from a client.
    RelayAssigned,
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
    /// Another transition for the same message was applied first.
    Conflict,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid expiry timestamp `{value}`: {source}")]
    InvalidExpiry {
        value: String,
        source: chrono::ParseError,
    },
    #[error("message carries no key material")]
    MissingKeyMaterial,
    #[error("message carries more than one key for recipient {0}")]
    DuplicateRecipient(UserId),
    #[error("message store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Routes messages between connected users and drives the delivery-status
/// state machine. It is the only component that mutates message status.
#[derive(Clone)]
pub struct Relay {
    store: Arc<dyn MessageStore>,
    registry: ConnectionRegistry,
    options: RelayOptions,
}

impl Relay {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: ConnectionRegistry,
        options: RelayOptions,
    ) -> Self {
        Self {
            store,
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Stores a new message, hands it to the receiver if they are online and
    /// acknowledges it to the sender.
    ///
    /// `delivered` is recorded before the frame is written, so a receiver
    /// acknowledging immediately always finds the message in `delivered`. A
    /// failed write moves it back to `sent`.
    pub async fn submit(
        &self,
        sender_id: UserId,
        request: SubmitMessage,
    ) -> Result<SubmitOutcome, RelayError> {
        let expires_at = parse_expiry(&request.expires_at)?;
        validate_keys(&request.keys)?;

        let message = NewMessage {
            sender_id,
            receiver_id: request.receiver_id,
            content: request.content,
            keys: request.keys,
            expires_at,
            attachments: request.attachments,
        };
        let message_id = self.store.create(&message).await?;
        let receiver_id = message.receiver_id;
        info!(%message_id, %sender_id, %receiver_id, "message stored");

        let mut record = StoredMessage {
            message_id,
            sender_id,
            receiver_id,
            content: message.content,
            keys: message.keys,
            status: MessageStatus::Sent,
            expires_at,
            attachments: message.attachments,
            created_at: Utc::now(),
        };

        let status = match self.registry.lookup(receiver_id).await {
            Some(receiver) => self.deliver(&receiver, &mut record).await,
            None => {
                debug!(%message_id, %receiver_id, "receiver offline; message stays sent");
                MessageStatus::Sent
            }
        };

        self.notify(sender_id, &ServerEnvelope::MessageSent { message_id, status })
            .await;

        Ok(SubmitOutcome { message_id, status })
    }

    /// Applies a receiver-requested status change if it is the next edge from
    /// the message's current status. Everything else is rejected without
    /// touching the message.
    pub async fn advance_status(
        &self,
        requester: UserId,
        message_id: MessageId,
        requested: MessageStatus,
    ) -> Result<TransitionOutcome, RelayError> {
        let Some(mut message) = self.store.get_by_id(message_id).await? else {
            return Ok(reject(requester, message_id, RejectReason::NotFound));
        };
        if message.receiver_id != requester {
            return Ok(reject(requester, message_id, RejectReason::NotReceiver));
        }
        if !requested.is_client_requestable() {
            return Ok(reject(requester, message_id, RejectReason::RelayAssigned));
        }

        let current = message.status;
        if !current.can_advance_to(requested) {
            return Ok(reject(
                requester,
                message_id,
                RejectReason::InvalidTransition {
                    from: current,
                    to: requested,
                },
            ));
        }

        message.status = requested;
        if !self.store.save(&message, current).await? {
            return Ok(reject(requester, message_id, RejectReason::Conflict));
        }
        info!(%message_id, from = %current, to = %requested, "message status advanced");

        let update = ServerEnvelope::StatusUpdate {
            message_id,
            status: requested,
        };
        self.notify(message.sender_id, &update).await;
        if self.options.echo_status_to_receiver && message.receiver_id != message.sender_id {
            self.notify(message.receiver_id, &update).await;
        }

        Ok(TransitionOutcome::Accepted {
            message_id,
            status: requested,
        })
    }

    pub async fn read_receipt(
        &self,
        requester: UserId,
        message_id: MessageId,
    ) -> Result<TransitionOutcome, RelayError> {
        self.advance_status(requester, message_id, MessageStatus::Read)
            .await
    }

    /// Decodes and dispatches one inbound text frame. Bad frames are logged
    /// and dropped; the connection stays up.
    pub async fn handle_text(&self, user_id: UserId, text: &str) {
        match decode_client_envelope(text) {
            Ok(envelope) => self.dispatch(user_id, envelope).await,
            Err(EnvelopeError::UnknownType(kind)) => {
                warn!(%user_id, %kind, "ignoring envelope of unknown type");
            }
            Err(error @ EnvelopeError::Malformed(_)) => {
                warn!(%user_id, %error, "dropping undecodable envelope");
            }
        }
    }

    pub async fn dispatch(&self, user_id: UserId, envelope: ClientEnvelope) {
        let kind = envelope.kind();
        let result = match envelope {
            ClientEnvelope::Message {
                receiver_id,
                content,
                keys,
                expires_at,
                attachments,
            } => self
                .submit(
                    user_id,
                    SubmitMessage {
                        receiver_id,
                        content,
                        keys,
                        expires_at,
                        attachments,
                    },
                )
                .await
                .map(|_| ()),
            ClientEnvelope::StatusUpdate { message_id, status } => self
                .advance_status(user_id, message_id, status)
                .await
                .map(|_| ()),
            ClientEnvelope::ReadReceipt { message_id } => {
                self.read_receipt(user_id, message_id).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => {}
            Err(error @ RelayError::Store(_)) => {
                error!(%user_id, kind, %error, "envelope aborted");
            }
            Err(error) => {
                warn!(%user_id, kind, %error, "envelope dropped");
            }
        }
    }

    /// Writes `new_message` to the receiver and returns the status the
    /// message is left in.
    async fn deliver(
        &self,
        receiver: &ConnectionWriter,
        record: &mut StoredMessage,
    ) -> MessageStatus {
        let message_id = record.message_id;
        let receiver_id = record.receiver_id;

        record.status = MessageStatus::Delivered;
        let claimed = match self.store.save(record, MessageStatus::Sent).await {
            Ok(claimed) => claimed,
            Err(error) => {
                error!(%message_id, %error, "failed to record delivery");
                false
            }
        };
        if !claimed {
            record.status = MessageStatus::Sent;
        }

        let frame = ServerEnvelope::NewMessage {
            message: MessagePayload {
                message_id,
                sender_id: record.sender_id,
                receiver_id,
                content: record.content.clone(),
                keys: record.keys.clone(),
                attachments: record.attachments.clone(),
                status: record.status,
                expires_at: record.expires_at,
            },
        };

        match receiver.send(&frame).await {
            Ok(()) => record.status,
            Err(error) => {
                debug!(%message_id, %receiver_id, %error, "receiver unreachable");
                self.forget_if_closed(receiver_id, receiver, &error).await;
                if claimed {
                    self.revert_delivery(record).await;
                }
                record.status
            }
        }
    }

    async fn revert_delivery(&self, record: &mut StoredMessage) {
        let message_id = record.message_id;
        record.status = MessageStatus::Sent;
        match self.store.save(record, MessageStatus::Delivered).await {
            Ok(true) => {}
            // The receiver acknowledged the frame even though the write
            // reported an error.
            Ok(false) => match self.store.get_by_id(message_id).await {
                Ok(Some(current)) => record.status = current.status,
                Ok(None) => {}
                Err(error) => error!(%message_id, %error, "failed to reload message"),
            },
            Err(error) => {
                error!(%message_id, %error, "failed to revert delivery");
                record.status = MessageStatus::Delivered;
            }
        }
    }

    /// Best-effort push to `user_id`; an unreachable peer is only logged.
    async fn notify(&self, user_id: UserId, envelope: &ServerEnvelope) {
        let Some(writer) = self.registry.lookup(user_id).await else {
            debug!(%user_id, "notification target offline");
            return;
        };
        if let Err(error) = writer.send(envelope).await {
            debug!(%user_id, %error, "notification not delivered");
            self.forget_if_closed(user_id, &writer, &error).await;
        }
    }

    async fn forget_if_closed(
        &self,
        user_id: UserId,
        writer: &ConnectionWriter,
        error: &WriteError,
    ) {
        if matches!(error, WriteError::Closed) {
            self.registry
                .unregister(user_id, writer.connection_id())
                .await;
        }
    }
}

fn reject(requester: UserId, message_id: MessageId, reason: RejectReason) -> TransitionOutcome {
    debug!(%requester, %message_id, ?reason, "status change rejected");
    TransitionOutcome::Rejected(reason)
}

fn validate_keys(keys: &[RecipientKey]) -> Result<(), RelayError> {
    if keys.is_empty() {
        return Err(RelayError::MissingKeyMaterial);
    }
    let mut seen = HashSet::with_capacity(keys.len());
    for key in keys {
        if !seen.insert(key.recipient_id) {
            return Err(RelayError::DuplicateRecipient(key.recipient_id));
        }
    }
    Ok(())
}

fn parse_expiry(raw: &str) -> Result<DateTime<Utc>, RelayError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| RelayError::InvalidExpiry {
            value: raw.to_string(),
            source,
        })
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
