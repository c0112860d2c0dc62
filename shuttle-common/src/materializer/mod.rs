//! # Materializer
//!
//! Turns classified message observations into store mutations, one family per materializer.
//! Every mutation is a single store call followed by one structured `tracing` event.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::{classify, Action, ClassifyError, Family, IgnoreReason, UnmappedPolicy};
use crate::events::StoreEvent;
use crate::message::{HexBytes, Message, MessageData, MessageType};
use crate::store::{
    CastRow, LinkRow, MessageStore, ReactionRow, StoreError, UserDataRow, VerificationRow,
    WriteOutcome,
};
use crate::time::{farcaster_time_to_datetime, TimeSource};

pub mod casts;
pub mod links;
pub mod reactions;
pub mod user_data;
pub mod verifications;

pub use casts::{cast_tombstone, CastMaterializer};
pub use links::{link_tombstone, LinkMaterializer};
pub use reactions::{reaction_tombstone, ReactionMaterializer};
pub use user_data::UserDataMaterializer;
pub use verifications::{verification_tombstone, VerificationMaterializer};

/// A message body that cannot be mapped to a row. Nothing is coerced.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("{family} message {hash} has no valid {field}")]
pub struct ValidationError {
    pub family: Family,
    pub field: &'static str,
    pub hash: HexBytes,
}

impl ValidationError {
    pub fn new(family: Family, field: &'static str, message: &Message) -> Self {
        Self {
            family,
            field,
            hash: message.hash.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Unmapped(#[from] ClassifyError),
    #[error("hub event could not be decoded: {0}")]
    Undecodable(String),
}

/// Everything a materializer needs besides the message itself.
pub struct ProcessingContext<'a> {
    pub store: &'a dyn MessageStore,
    pub clock: &'a dyn TimeSource,
    /// Parent of every event logged while processing. Carries shard or job fields.
    pub span: tracing::Span,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(store: &'a dyn MessageStore, clock: &'a dyn TimeSource, span: tracing::Span) -> Self {
        Self { store, clock, span }
    }
}

#[async_trait]
pub trait Materializer: Send + Sync {
    fn family(&self) -> Family;

    /// Map an add message to its row and write it.
    async fn insert_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError>;

    /// Tombstone the row a remove message refers to.
    async fn delete_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError>;
}

/// Shared field accessors for the per-family mapping functions.
pub(crate) fn message_data(family: Family, message: &Message) -> Result<&MessageData, ValidationError> {
    message
        .data
        .as_ref()
        .ok_or_else(|| ValidationError::new(family, "data", message))
}

pub(crate) fn message_fid(family: Family, message: &Message) -> Result<u64, ValidationError> {
    message
        .fid()
        .ok_or_else(|| ValidationError::new(family, "fid", message))
}

pub(crate) fn message_timestamp(
    family: Family,
    message: &Message,
) -> Result<DateTime<Utc>, ValidationError> {
    message
        .timestamp()
        .and_then(farcaster_time_to_datetime)
        .ok_or_else(|| ValidationError::new(family, "timestamp", message))
}

/// When a remove took effect: its own timestamp, or processing time if it carries none.
pub(crate) fn removed_at(message: &Message, clock: &dyn TimeSource) -> DateTime<Utc> {
    message
        .timestamp()
        .and_then(farcaster_time_to_datetime)
        .unwrap_or_else(|| clock.current_time())
}

/// The family and semantic key a message writes to, matching `LocalRecord::key`.
/// `None` for messages that are unmapped or fail validation.
pub fn record_key(message: &Message, clock: &dyn TimeSource) -> Option<(Family, String)> {
    let keyed = match message.message_type()? {
        MessageType::CastAdd => (Family::Cast, CastRow::try_from(message).ok()?.key().encode()),
        MessageType::CastRemove => (Family::Cast, cast_tombstone(message, clock).ok()?.key.encode()),
        MessageType::ReactionAdd => (
            Family::Reaction,
            ReactionRow::try_from(message).ok()?.key().encode(),
        ),
        MessageType::ReactionRemove => (
            Family::Reaction,
            reaction_tombstone(message, clock).ok()?.key.encode(),
        ),
        MessageType::LinkAdd => (Family::Link, LinkRow::try_from(message).ok()?.key().encode()),
        MessageType::LinkRemove => (Family::Link, link_tombstone(message, clock).ok()?.key.encode()),
        MessageType::VerificationAddAddress => (
            Family::Verification,
            VerificationRow::try_from(message).ok()?.key().encode(),
        ),
        MessageType::VerificationRemove => (
            Family::Verification,
            verification_tombstone(message, clock).ok()?.key.encode(),
        ),
        MessageType::UserDataAdd => (
            Family::UserData,
            UserDataRow::try_from(message).ok()?.user_data_type.to_string(),
        ),
        _ => return None,
    };

    Some(keyed)
}

pub(crate) fn log_write(ctx: &ProcessingContext<'_>, family: Family, key: &str, outcome: WriteOutcome) {
    debug!(
        parent: &ctx.span,
        family = family.as_str(),
        key,
        outcome = outcome.as_str(),
        state = outcome.lifecycle(),
        "materialized message"
    );
}

/// What the writer did with one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied {
        family: Family,
        outcome: WriteOutcome,
    },
    Ignored {
        family: Family,
        reason: IgnoreReason,
    },
    /// Upstream already knew the message, so it has already been processed.
    AlreadyKnown,
    /// Unmapped or invalid, skipped by policy.
    Skipped,
}

/// Routes observations to the materializer of their family.
pub struct MessageWriter {
    policy: UnmappedPolicy,
    casts: CastMaterializer,
    reactions: ReactionMaterializer,
    links: LinkMaterializer,
    user_data: UserDataMaterializer,
    verifications: VerificationMaterializer,
}

impl MessageWriter {
    pub fn new(policy: UnmappedPolicy) -> Self {
        Self {
            policy,
            casts: CastMaterializer,
            reactions: ReactionMaterializer,
            links: LinkMaterializer,
            user_data: UserDataMaterializer,
            verifications: VerificationMaterializer,
        }
    }

    pub fn policy(&self) -> UnmappedPolicy {
        self.policy
    }

    fn materializer(&self, family: Family) -> &dyn Materializer {
        match family {
            Family::Cast => &self.casts,
            Family::Reaction => &self.reactions,
            Family::Link => &self.links,
            Family::UserData => &self.user_data,
            Family::Verification => &self.verifications,
        }
    }

    /// Process one observation. Observations upstream already knew are not re-applied.
    pub async fn handle_event(
        &self,
        ctx: &ProcessingContext<'_>,
        event: &StoreEvent,
    ) -> Result<Disposition, MaterializeError> {
        if !event.is_new {
            return Ok(Disposition::AlreadyKnown);
        }

        self.write_message(ctx, event).await
    }

    /// Apply the unmapped policy to a hub event that could not be decoded into a message.
    pub fn handle_undecodable(
        &self,
        ctx: &ProcessingContext<'_>,
        event_id: Option<u64>,
        reason: &str,
    ) -> Result<Disposition, MaterializeError> {
        metrics::counter!("shuttle_unmapped_messages_total", "type" => "undecodable").increment(1);
        match self.policy {
            UnmappedPolicy::Fail => Err(MaterializeError::Undecodable(reason.to_owned())),
            UnmappedPolicy::Skip => {
                warn!(parent: &ctx.span, ?event_id, reason, "skipping undecodable hub event");
                Ok(Disposition::Skipped)
            }
        }
    }

    /// Classify and apply one observation, applying the unmapped policy to messages that
    /// cannot be classified or mapped.
    pub async fn write_message(
        &self,
        ctx: &ProcessingContext<'_>,
        event: &StoreEvent,
    ) -> Result<Disposition, MaterializeError> {
        let message = &event.message;

        let route = match classify(message, event.operation, event.state) {
            Ok(route) => route,
            Err(error) => {
                let message_type = message
                    .message_type()
                    .map(|message_type| format!("{message_type:?}"))
                    .unwrap_or_else(|| "none".to_owned());
                metrics::counter!("shuttle_unmapped_messages_total", "type" => message_type.clone())
                    .increment(1);
                return match self.policy {
                    UnmappedPolicy::Fail => Err(error.into()),
                    UnmappedPolicy::Skip => {
                        warn!(parent: &ctx.span, hash = %message.hash, message_type = %message_type, "skipping unmapped message");
                        Ok(Disposition::Skipped)
                    }
                };
            }
        };

        let family = route.family;
        let materializer = self.materializer(family);
        let result = match route.action {
            Action::Insert => materializer.insert_one(ctx, message).await,
            Action::Delete => materializer.delete_one(ctx, message).await,
            Action::Ignore(reason) => {
                if matches!(reason, IgnoreReason::Pruned | IgnoreReason::Revoked) {
                    info!(
                        parent: &ctx.span,
                        family = family.as_str(),
                        hash = %message.hash,
                        operation = %event.operation,
                        "upstream {} not auto-applied",
                        reason.as_str()
                    );
                }
                metrics::counter!("shuttle_messages_ignored_total", "family" => family.as_str(), "reason" => reason.as_str())
                    .increment(1);
                return Ok(Disposition::Ignored { family, reason });
            }
        };

        match result {
            Ok(outcome) => {
                info!(
                    parent: &ctx.span,
                    family = family.as_str(),
                    hash = %message.hash,
                    operation = %event.operation,
                    state = %event.state,
                    was_missed = event.was_missed,
                    "processed message"
                );
                metrics::counter!("shuttle_messages_processed_total", "family" => family.as_str(), "outcome" => outcome.as_str())
                    .increment(1);
                Ok(Disposition::Applied { family, outcome })
            }
            Err(MaterializeError::Validation(error)) => {
                metrics::counter!("shuttle_invalid_messages_total", "family" => family.as_str())
                    .increment(1);
                match self.policy {
                    UnmappedPolicy::Fail => Err(error.into()),
                    UnmappedPolicy::Skip => {
                        warn!(parent: &ctx.span, %error, "skipping invalid message");
                        Ok(Disposition::Skipped)
                    }
                }
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Operation;
    use crate::message::MessageType;
    use crate::store::memory::MemoryStore;
    use crate::test_utils::{cast_add, cast_remove, reaction_add, user_data_add, CLOCK};

    fn context(store: &MemoryStore) -> ProcessingContext<'_> {
        ProcessingContext::new(store, &CLOCK, tracing::Span::none())
    }

    fn unknown_message() -> Message {
        Message {
            data: Some(MessageData::new(MessageType::UsernameProof, 1, 10)),
            hash: HexBytes(vec![0x99]),
        }
    }

    #[tokio::test]
    async fn test_cast_create_then_remove() {
        let store = MemoryStore::new();
        let ctx = context(&store);
        let writer = MessageWriter::new(UnmappedPolicy::Fail);
        let add = cast_add(1, 0xaa, 10, "hello");
        let remove = cast_remove(1, 0xbb, 20, 0xaa);

        let created = writer
            .handle_event(&ctx, &StoreEvent::merged(1, add.clone()))
            .await
            .unwrap();
        let deleted_add = writer
            .handle_event(&ctx, &StoreEvent::deleted(2, add, Operation::Delete))
            .await
            .unwrap();
        let removed = writer
            .handle_event(&ctx, &StoreEvent::merged(2, remove))
            .await
            .unwrap();

        assert_eq!(
            created,
            Disposition::Applied {
                family: Family::Cast,
                outcome: WriteOutcome::Inserted { deleted: false }
            }
        );
        assert_eq!(
            deleted_add,
            Disposition::Ignored {
                family: Family::Cast,
                reason: IgnoreReason::CoveredByRemove
            }
        );
        assert_eq!(
            removed,
            Disposition::Applied {
                family: Family::Cast,
                outcome: WriteOutcome::Tombstoned
            }
        );

        let stored = store.cast(&HexBytes(vec![0xaa])).unwrap();
        assert_eq!(stored.row.text, "hello");
        assert!(stored.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_already_known_messages_are_not_applied() {
        let store = MemoryStore::new();
        let ctx = context(&store);
        let writer = MessageWriter::new(UnmappedPolicy::Fail);
        let mut event = StoreEvent::merged(1, cast_add(1, 0xaa, 10, "hello"));
        event.is_new = false;

        let disposition = writer.handle_event(&ctx, &event).await.unwrap();

        assert_eq!(disposition, Disposition::AlreadyKnown);
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_unmapped_policy_fail() {
        let store = MemoryStore::new();
        let ctx = context(&store);
        let writer = MessageWriter::new(UnmappedPolicy::Fail);

        let result = writer
            .write_message(&ctx, &StoreEvent::merged(1, unknown_message()))
            .await;

        assert!(matches!(
            result,
            Err(MaterializeError::Unmapped(ClassifyError::UnmappedMessageType(
                MessageType::UsernameProof
            )))
        ));
    }

    #[tokio::test]
    async fn test_unmapped_policy_skip() {
        let store = MemoryStore::new();
        let ctx = context(&store);
        let writer = MessageWriter::new(UnmappedPolicy::Skip);

        let disposition = writer
            .write_message(&ctx, &StoreEvent::merged(1, unknown_message()))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Skipped);
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_message_follows_policy() {
        let store = MemoryStore::new();
        let ctx = context(&store);
        let mut invalid = reaction_add(2, 0x01, 10, 1, 0xaa);
        invalid.data.as_mut().unwrap().reaction_body = None;

        let failed = MessageWriter::new(UnmappedPolicy::Fail)
            .write_message(&ctx, &StoreEvent::merged(1, invalid.clone()))
            .await;
        let skipped = MessageWriter::new(UnmappedPolicy::Skip)
            .write_message(&ctx, &StoreEvent::merged(1, invalid))
            .await
            .unwrap();

        assert!(matches!(
            failed,
            Err(MaterializeError::Validation(ValidationError {
                family: Family::Reaction,
                field: "reaction_body",
                ..
            }))
        ));
        assert_eq!(skipped, Disposition::Skipped);
    }

    #[test]
    fn test_undecodable_event_follows_policy() {
        let store = MemoryStore::new();
        let ctx = context(&store);

        let failed = MessageWriter::new(UnmappedPolicy::Fail).handle_undecodable(
            &ctx,
            Some(6),
            "invalid hash",
        );
        let skipped = MessageWriter::new(UnmappedPolicy::Skip)
            .handle_undecodable(&ctx, Some(6), "invalid hash")
            .unwrap();

        assert!(matches!(failed, Err(MaterializeError::Undecodable(reason)) if reason == "invalid hash"));
        assert_eq!(skipped, Disposition::Skipped);
    }

    #[tokio::test]
    async fn test_prune_is_not_applied() {
        let store = MemoryStore::new();
        let ctx = context(&store);
        let writer = MessageWriter::new(UnmappedPolicy::Fail);
        let add = user_data_add(1, 0x01, 10, 6, "alice");

        writer
            .handle_event(&ctx, &StoreEvent::merged(1, add.clone()))
            .await
            .unwrap();
        let pruned = writer
            .handle_event(&ctx, &StoreEvent::deleted(2, add, Operation::Prune))
            .await
            .unwrap();

        assert_eq!(
            pruned,
            Disposition::Ignored {
                family: Family::UserData,
                reason: IgnoreReason::Pruned
            }
        );
        assert_eq!(store.user_data(1, 6).unwrap().value, "alice");
    }

    #[tokio::test]
    async fn test_remove_then_add_in_any_order_converges() {
        let add = cast_add(1, 0xaa, 10, "hello");
        let remove = cast_remove(1, 0xbb, 20, 0xaa);
        let writer = MessageWriter::new(UnmappedPolicy::Fail);

        let in_order = MemoryStore::new();
        let reversed = MemoryStore::new();
        for (store, messages) in [
            (&in_order, [add.clone(), remove.clone()]),
            (&reversed, [remove, add]),
        ] {
            let ctx = context(store);
            for message in messages {
                let event = StoreEvent::merged(1, message);
                writer.handle_event(&ctx, &event).await.unwrap();
            }
        }

        assert_eq!(
            in_order.cast(&HexBytes(vec![0xaa])),
            reversed.cast(&HexBytes(vec![0xaa]))
        );
        assert!(reversed.cast(&HexBytes(vec![0xaa])).unwrap().deleted_at.is_some());
    }
}
