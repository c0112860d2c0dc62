use async_trait::async_trait;

use super::{
    log_write, message_data, message_fid, message_timestamp, removed_at, MaterializeError,
    Materializer, ProcessingContext, ValidationError,
};
use crate::classifier::Family;
use crate::message::{Message, Protocol};
use crate::store::{Tombstone, TombstoneKey, VerificationRow, WriteOutcome};
use crate::time::TimeSource;

impl TryFrom<&Message> for VerificationRow {
    type Error = ValidationError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let body = message_data(Family::Verification, message)?
            .verification_add_address_body
            .as_ref()
            .ok_or_else(|| {
                ValidationError::new(Family::Verification, "verification_add_address_body", message)
            })?;

        let signer_address = body
            .address
            .clone()
            .filter(|address| !address.is_empty())
            .ok_or_else(|| ValidationError::new(Family::Verification, "address", message))?;

        Ok(VerificationRow {
            fid: message_fid(Family::Verification, message)?,
            hash: message.hash.clone(),
            timestamp: message_timestamp(Family::Verification, message)?,
            signer_address,
            block_hash: body.block_hash.clone(),
            signature: body.claim_signature.clone(),
            protocol: body
                .protocol
                .unwrap_or(Protocol::Ethereum)
                .code()
                .ok_or_else(|| ValidationError::new(Family::Verification, "protocol", message))?,
        })
    }
}

pub fn verification_tombstone(
    message: &Message,
    clock: &dyn TimeSource,
) -> Result<Tombstone, ValidationError> {
    let address = message_data(Family::Verification, message)?
        .verification_remove_body
        .as_ref()
        .and_then(|body| body.address.clone())
        .filter(|address| !address.is_empty())
        .ok_or_else(|| ValidationError::new(Family::Verification, "address", message))?;

    Ok(Tombstone {
        family: Family::Verification,
        fid: message_fid(Family::Verification, message)?,
        key: TombstoneKey::Verification { address },
        hash: message.hash.clone(),
        deleted_at: removed_at(message, clock),
    })
}

pub struct VerificationMaterializer;

#[async_trait]
impl Materializer for VerificationMaterializer {
    fn family(&self) -> Family {
        Family::Verification
    }

    async fn insert_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let row = VerificationRow::try_from(message)?;
        let outcome = ctx.store.insert_verification(&row).await?;
        log_write(ctx, self.family(), &row.key().encode(), outcome);
        Ok(outcome)
    }

    async fn delete_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let tombstone = verification_tombstone(message, ctx.clock)?;
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
    use crate::test_utils::{verification_add, verification_remove, CLOCK};

    #[test]
    fn test_protocol_defaults_to_ethereum() {
        let row = VerificationRow::try_from(&verification_add(1, 0x01, 10, 0xee)).unwrap();

        assert_eq!(row.protocol, 0);
        assert_eq!(row.signer_address, HexBytes(vec![0xee]));
    }

    #[test]
    fn test_unknown_protocol_is_invalid() {
        let mut message = verification_add(1, 0x01, 10, 0xee);
        if let Some(body) = message
            .data
            .as_mut()
            .and_then(|data| data.verification_add_address_body.as_mut())
        {
            body.protocol = Some(Protocol::Unknown);
        }

        let error = VerificationRow::try_from(&message).unwrap_err();

        assert_eq!(error.field, "protocol");
    }

    #[tokio::test]
    async fn test_verify_then_remove() {
        let store = MemoryStore::new();
        let ctx = ProcessingContext::new(&store, &CLOCK, tracing::Span::none());

        VerificationMaterializer
            .insert_one(&ctx, &verification_add(1, 0x01, 10, 0xee))
            .await
            .unwrap();
        let duplicate = VerificationMaterializer
            .insert_one(&ctx, &verification_add(1, 0x02, 11, 0xee))
            .await
            .unwrap();
        let removed = VerificationMaterializer
            .delete_one(&ctx, &verification_remove(1, 0x03, 20, 0xee))
            .await
            .unwrap();

        assert_eq!(duplicate, WriteOutcome::Unchanged);
        assert_eq!(removed, WriteOutcome::Tombstoned);
        let rows = store.verifications(1);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].deleted_at.is_some());
    }
}
