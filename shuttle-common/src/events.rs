//! # Events
//!
//! Hub events and their expansion into the per-message tuples consumed by the writer.
use std::fmt;

use serde::Deserialize;

use crate::message::Message;

/// The store operation upstream performed on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// The message was merged into authoritative state.
    Merge,
    /// The message was deleted by a later message (an explicit remove, or a newer add for the same key).
    Delete,
    /// The message was pruned because its identity ran out of storage.
    Prune,
    /// The message was revoked together with the signer that signed it.
    Revoke,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Merge => "merge",
            Operation::Delete => "delete",
            Operation::Prune => "prune",
            Operation::Revoke => "revoke",
        };
        f.write_str(name)
    }
}

/// Lifecycle transition a message is observed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Created,
    Deleted,
}

impl MessageState {
    /// The state a merged message is in: adds create state, removes delete it.
    pub fn for_merged(message: &Message) -> Self {
        if message.is_add() {
            MessageState::Created
        } else {
            MessageState::Deleted
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageState::Created => f.write_str("created"),
            MessageState::Deleted => f.write_str("deleted"),
        }
    }
}

/// One message observation delivered by the event source.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    /// Id of the hub event this observation came from. Used as the shard position.
    pub event_id: u64,
    pub message: Message,
    pub operation: Operation,
    pub state: MessageState,
    /// False when upstream reports the message was already known. Nothing to do for those.
    pub is_new: bool,
    /// True when the message is delivered by reconciliation rather than the live stream.
    pub was_missed: bool,
}

impl StoreEvent {
    pub fn merged(event_id: u64, message: Message) -> Self {
        let state = MessageState::for_merged(&message);
        Self {
            event_id,
            message,
            operation: Operation::Merge,
            state,
            is_new: true,
            was_missed: false,
        }
    }

    pub fn deleted(event_id: u64, message: Message, operation: Operation) -> Self {
        Self {
            event_id,
            message,
            operation,
            state: MessageState::Deleted,
            is_new: true,
            was_missed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HubEventType {
    #[serde(rename = "HUB_EVENT_TYPE_MERGE_MESSAGE")]
    MergeMessage,
    #[serde(rename = "HUB_EVENT_TYPE_PRUNE_MESSAGE")]
    PruneMessage,
    #[serde(rename = "HUB_EVENT_TYPE_REVOKE_MESSAGE")]
    RevokeMessage,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeMessageBody {
    pub message: Message,
    #[serde(default)]
    pub deleted_messages: Vec<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEventBody {
    pub message: Message,
}

/// An event as emitted by the hub's event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: HubEventType,
    pub merge_message_body: Option<MergeMessageBody>,
    pub prune_message_body: Option<MessageEventBody>,
    pub revoke_message_body: Option<MessageEventBody>,
}

impl HubEvent {
    /// The identity this event concerns, if it concerns a message at all.
    pub fn fid(&self) -> Option<u64> {
        match self.event_type {
            HubEventType::MergeMessage => self
                .merge_message_body
                .as_ref()
                .and_then(|body| body.message.fid()),
            HubEventType::PruneMessage => self
                .prune_message_body
                .as_ref()
                .and_then(|body| body.message.fid()),
            HubEventType::RevokeMessage => self
                .revoke_message_body
                .as_ref()
                .and_then(|body| body.message.fid()),
            HubEventType::Other => None,
        }
    }

    /// Expand this event into message observations, in the order they must be applied.
    /// Messages deleted by a merge come first, then the merged message itself.
    pub fn into_store_events(self) -> Vec<StoreEvent> {
        let id = self.id;
        match self.event_type {
            HubEventType::MergeMessage => match self.merge_message_body {
                Some(body) => {
                    let mut events: Vec<StoreEvent> = body
                        .deleted_messages
                        .into_iter()
                        .map(|message| StoreEvent::deleted(id, message, Operation::Delete))
                        .collect();
                    events.push(StoreEvent::merged(id, body.message));
                    events
                }
                None => Vec::new(),
            },
            HubEventType::PruneMessage => self
                .prune_message_body
                .map(|body| vec![StoreEvent::deleted(id, body.message, Operation::Prune)])
                .unwrap_or_default(),
            HubEventType::RevokeMessage => self
                .revoke_message_body
                .map(|body| vec![StoreEvent::deleted(id, body.message, Operation::Revoke)])
                .unwrap_or_default(),
            HubEventType::Other => Vec::new(),
        }
    }
}
