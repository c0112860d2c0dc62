use async_trait::async_trait;

use super::{
    log_write, message_data, message_fid, message_timestamp, removed_at, MaterializeError,
    Materializer, ProcessingContext, ValidationError,
};
use crate::classifier::Family;
use crate::message::Message;
use crate::store::{CastRow, Tombstone, TombstoneKey, WriteOutcome};
use crate::time::TimeSource;

impl TryFrom<&Message> for CastRow {
    type Error = ValidationError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let data = message_data(Family::Cast, message)?;
        let body = data
            .cast_add_body
            .as_ref()
            .ok_or_else(|| ValidationError::new(Family::Cast, "cast_add_body", message))?;

        let (parent_fid, parent_hash) = match &body.parent_cast_id {
            Some(parent) => (Some(parent.fid), Some(parent.hash.clone())),
            None => (None, None),
        };

        Ok(CastRow {
            fid: message_fid(Family::Cast, message)?,
            hash: message.hash.clone(),
            timestamp: message_timestamp(Family::Cast, message)?,
            parent_fid,
            parent_hash,
            parent_url: body.parent_url.clone(),
            text: body.text.clone(),
            embeds: serde_json::Value::from(body.embeds.clone()),
            mentions: serde_json::Value::from(body.mentions.clone()),
            mentions_positions: serde_json::Value::from(body.mentions_positions.clone()),
        })
    }
}

/// Casts are removed by the hash of the add they target.
pub fn cast_tombstone(message: &Message, clock: &dyn TimeSource) -> Result<Tombstone, ValidationError> {
    let data = message_data(Family::Cast, message)?;
    let target_hash = data
        .cast_remove_body
        .as_ref()
        .and_then(|body| body.target_hash.clone())
        .filter(|hash| !hash.is_empty())
        .ok_or_else(|| ValidationError::new(Family::Cast, "target_hash", message))?;

    Ok(Tombstone {
        family: Family::Cast,
        fid: message_fid(Family::Cast, message)?,
        key: TombstoneKey::Hash(target_hash),
        hash: message.hash.clone(),
        deleted_at: removed_at(message, clock),
    })
}

pub struct CastMaterializer;

#[async_trait]
impl Materializer for CastMaterializer {
    fn family(&self) -> Family {
        Family::Cast
    }

    async fn insert_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let row = CastRow::try_from(message)?;
        let outcome = ctx.store.insert_cast(&row).await?;
        log_write(ctx, self.family(), &row.hash.to_string(), outcome);
        Ok(outcome)
    }

    async fn delete_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let tombstone = cast_tombstone(message, ctx.clock)?;
        let outcome = ctx.store.tombstone(&tombstone).await?;
        log_write(ctx, self.family(), &tombstone.key.encode(), outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HexBytes;
    use crate::store::memory::MemoryStore;
    use crate::test_utils::{cast_add, cast_remove, cast_reply, CLOCK};
    use crate::time::farcaster_time_to_datetime;

    #[test]
    fn test_cast_row_from_message() {
        let row = CastRow::try_from(&cast_reply(2, 0x01, 10, "reply", 1, 0xaa)).unwrap();

        assert_eq!(row.fid, 2);
        assert_eq!(row.text, "reply");
        assert_eq!(row.parent_fid, Some(1));
        assert_eq!(row.parent_hash, Some(HexBytes(vec![0xaa])));
        assert_eq!(row.timestamp, farcaster_time_to_datetime(10).unwrap());
        assert_eq!(row.mentions, serde_json::json!([]));
    }

    #[test]
    fn test_cast_without_body_is_invalid() {
        let mut message = cast_add(1, 0x01, 10, "hello");
        message.data.as_mut().unwrap().cast_add_body = None;

        let error = CastRow::try_from(&message).unwrap_err();

        assert_eq!(error.field, "cast_add_body");
    }

    #[test]
    fn test_remove_without_timestamp_uses_processing_time() {
        let mut message = cast_remove(1, 0xbb, 10, 0xaa);
        message.data.as_mut().unwrap().timestamp = None;

        let tombstone = cast_tombstone(&message, &CLOCK).unwrap();

        assert_eq!(tombstone.deleted_at, CLOCK.current_time());
        assert_eq!(tombstone.key, TombstoneKey::Hash(HexBytes(vec![0xaa])));
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryStore::new();
        let ctx = ProcessingContext::new(&store, &CLOCK, tracing::Span::none());
        let message = cast_add(1, 0xaa, 10, "hello");

        for _ in 0..3 {
            CastMaterializer.insert_one(&ctx, &message).await.unwrap();
        }

        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_replayed_add_after_remove_stays_deleted() {
        let store = MemoryStore::new();
        let ctx = ProcessingContext::new(&store, &CLOCK, tracing::Span::none());
        let add = cast_add(1, 0xaa, 10, "hello");
        let remove = cast_remove(1, 0xbb, 20, 0xaa);

        CastMaterializer.insert_one(&ctx, &add).await.unwrap();
        CastMaterializer.delete_one(&ctx, &remove).await.unwrap();
        let deleted_at = store.cast(&add.hash).unwrap().deleted_at;

        let replayed = CastMaterializer.insert_one(&ctx, &add).await.unwrap();
        let removed_again = CastMaterializer.delete_one(&ctx, &remove).await.unwrap();

        assert_eq!(replayed, WriteOutcome::Unchanged);
        assert_eq!(removed_again, WriteOutcome::Unchanged);
        assert_eq!(store.cast(&add.hash).unwrap().deleted_at, deleted_at);
        assert_eq!(deleted_at, farcaster_time_to_datetime(20));
    }
}
