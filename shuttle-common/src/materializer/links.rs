use async_trait::async_trait;

use super::{
    log_write, message_data, message_fid, message_timestamp, removed_at, MaterializeError,
    Materializer, ProcessingContext, ValidationError,
};
use crate::classifier::Family;
use crate::message::{LinkBody, Message};
use crate::store::{LinkRow, Tombstone, TombstoneKey, WriteOutcome};
use crate::time::{farcaster_time_to_datetime, TimeSource};

fn link_body(message: &Message) -> Result<&LinkBody, ValidationError> {
    message_data(Family::Link, message)?
        .link_body
        .as_ref()
        .ok_or_else(|| ValidationError::new(Family::Link, "link_body", message))
}

fn link_key(message: &Message) -> Result<(String, u64), ValidationError> {
    let body = link_body(message)?;
    let link_type = body
        .link_type
        .clone()
        .filter(|link_type| !link_type.is_empty())
        .ok_or_else(|| ValidationError::new(Family::Link, "type", message))?;
    let target_fid = body
        .target_fid
        .ok_or_else(|| ValidationError::new(Family::Link, "target_fid", message))?;

    Ok((link_type, target_fid))
}

impl TryFrom<&Message> for LinkRow {
    type Error = ValidationError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let (link_type, target_fid) = link_key(message)?;
        let display_timestamp = match link_body(message)?.display_timestamp {
            Some(timestamp) => Some(
                farcaster_time_to_datetime(timestamp)
                    .ok_or_else(|| ValidationError::new(Family::Link, "display_timestamp", message))?,
            ),
            None => None,
        };

        Ok(LinkRow {
            fid: message_fid(Family::Link, message)?,
            hash: message.hash.clone(),
            timestamp: message_timestamp(Family::Link, message)?,
            link_type,
            target_fid,
            display_timestamp,
        })
    }
}

pub fn link_tombstone(message: &Message, clock: &dyn TimeSource) -> Result<Tombstone, ValidationError> {
    let (link_type, target_fid) = link_key(message)?;

    Ok(Tombstone {
        family: Family::Link,
        fid: message_fid(Family::Link, message)?,
        key: TombstoneKey::Link {
            link_type,
            target_fid,
        },
        hash: message.hash.clone(),
        deleted_at: removed_at(message, clock),
    })
}

pub struct LinkMaterializer;

#[async_trait]
impl Materializer for LinkMaterializer {
    fn family(&self) -> Family {
        Family::Link
    }

    async fn insert_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let row = LinkRow::try_from(message)?;
        let outcome = ctx.store.insert_link(&row).await?;
        log_write(ctx, self.family(), &row.key().encode(), outcome);
        Ok(outcome)
    }

    async fn delete_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let tombstone = link_tombstone(message, ctx.clock)?;
        let outcome = ctx.store.tombstone(&tombstone).await?;
        log_write(ctx, self.family(), &tombstone.key.encode(), outcome);
        Ok(outcome)
    }
}
