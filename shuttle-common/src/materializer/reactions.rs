use async_trait::async_trait;

use super::{
    log_write, message_data, message_fid, message_timestamp, removed_at, MaterializeError,
    Materializer, ProcessingContext, ValidationError,
};
use crate::classifier::Family;
use crate::message::{Message, ReactionBody};
use crate::store::{ReactionRow, ReactionTarget, Tombstone, TombstoneKey, WriteOutcome};
use crate::time::TimeSource;

/// Type and target of a reaction body. Shared by adds and removes.
fn reaction_key(message: &Message) -> Result<(i16, ReactionTarget), ValidationError> {
    let body: &ReactionBody = message_data(Family::Reaction, message)?
        .reaction_body
        .as_ref()
        .ok_or_else(|| ValidationError::new(Family::Reaction, "reaction_body", message))?;

    let reaction_type = body
        .reaction_type
        .and_then(|reaction_type| reaction_type.code())
        .ok_or_else(|| ValidationError::new(Family::Reaction, "type", message))?;

    let target = match (&body.target_cast_id, &body.target_url) {
        (Some(cast_id), None) => ReactionTarget::Cast {
            fid: cast_id.fid,
            hash: cast_id.hash.clone(),
        },
        (None, Some(url)) if !url.is_empty() => ReactionTarget::Url(url.clone()),
        _ => return Err(ValidationError::new(Family::Reaction, "target", message)),
    };

    Ok((reaction_type, target))
}

impl TryFrom<&Message> for ReactionRow {
    type Error = ValidationError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let (reaction_type, target) = reaction_key(message)?;

        Ok(ReactionRow {
            fid: message_fid(Family::Reaction, message)?,
            hash: message.hash.clone(),
            timestamp: message_timestamp(Family::Reaction, message)?,
            reaction_type,
            target,
        })
    }
}

pub fn reaction_tombstone(
    message: &Message,
    clock: &dyn TimeSource,
) -> Result<Tombstone, ValidationError> {
    let (reaction_type, target) = reaction_key(message)?;

    Ok(Tombstone {
        family: Family::Reaction,
        fid: message_fid(Family::Reaction, message)?,
        key: TombstoneKey::Reaction {
            reaction_type,
            target,
        },
        hash: message.hash.clone(),
        deleted_at: removed_at(message, clock),
    })
}

pub struct ReactionMaterializer;

#[async_trait]
impl Materializer for ReactionMaterializer {
    fn family(&self) -> Family {
        Family::Reaction
    }

    async fn insert_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let row = ReactionRow::try_from(message)?;
        let outcome = ctx.store.insert_reaction(&row).await?;
        log_write(ctx, self.family(), &row.key().encode(), outcome);
        Ok(outcome)
    }

    async fn delete_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let tombstone = reaction_tombstone(message, ctx.clock)?;
        let outcome = ctx.store.tombstone(&tombstone).await?;
        log_write(ctx, self.family(), &tombstone.key.encode(), outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HexBytes, MessageType};
    use crate::store::memory::MemoryStore;
    use crate::test_utils::{reaction_add, reaction_remove, url_reaction_add, CLOCK};

    #[test]
    fn test_reaction_target_must_be_exactly_one() {
        let mut message = reaction_add(2, 0x01, 10, 1, 0xaa);
        message
            .data
            .as_mut()
            .unwrap()
            .reaction_body
            .as_mut()
            .unwrap()
            .target_url = Some("https://example.com".to_owned());

        let error = ReactionRow::try_from(&message).unwrap_err();

        assert_eq!(error.field, "target");
    }

    #[test]
    fn test_url_reaction_row() {
        let row = ReactionRow::try_from(&url_reaction_add(2, 0x01, 10, 2, "https://example.com"))
            .unwrap();

        assert_eq!(row.reaction_type, 2);
        assert_eq!(row.target, ReactionTarget::Url("https://example.com".to_owned()));
    }

    #[test]
    fn test_remove_key_matches_add_key() {
        let add = ReactionRow::try_from(&reaction_add(2, 0x01, 10, 1, 0xaa)).unwrap();
        let remove = reaction_remove(2, 0x02, 20, 1, 0xaa);

        let tombstone = reaction_tombstone(&remove, &CLOCK).unwrap();

        assert_eq!(remove.message_type(), Some(MessageType::ReactionRemove));
        assert_eq!(tombstone.key, add.key());
        assert_eq!(tombstone.hash, HexBytes(vec![0x02]));
    }

    #[tokio::test]
    async fn test_duplicate_reaction_keeps_one_row() {
        let store = MemoryStore::new();
        let ctx = ProcessingContext::new(&store, &CLOCK, tracing::Span::none());

        let first = ReactionMaterializer
            .insert_one(&ctx, &reaction_add(2, 0x01, 10, 1, 0xaa))
            .await
            .unwrap();
        let second = ReactionMaterializer
            .insert_one(&ctx, &reaction_add(2, 0x02, 11, 1, 0xaa))
            .await
            .unwrap();

        assert_eq!(first, WriteOutcome::Inserted { deleted: false });
        assert_eq!(second, WriteOutcome::Unchanged);
        assert_eq!(store.reactions(2).len(), 1);
    }

    #[tokio::test]
    async fn test_like_unlike_like_again() {
        let store = MemoryStore::new();
        let ctx = ProcessingContext::new(&store, &CLOCK, tracing::Span::none());

        ReactionMaterializer
            .insert_one(&ctx, &reaction_add(2, 0x01, 10, 1, 0xaa))
            .await
            .unwrap();
        let unliked = ReactionMaterializer
            .delete_one(&ctx, &reaction_remove(2, 0x02, 20, 1, 0xaa))
            .await
            .unwrap();
        let liked_again = ReactionMaterializer
            .insert_one(&ctx, &reaction_add(2, 0x03, 30, 1, 0xaa))
            .await
            .unwrap();

        assert_eq!(unliked, WriteOutcome::Tombstoned);
        assert_eq!(liked_again, WriteOutcome::Revived);
        let rows = store.reactions(2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].deleted_at, None);
        assert_eq!(rows[0].row.hash, HexBytes(vec![0x03]));
    }
}
