use async_trait::async_trait;

use super::{
    log_write, message_data, message_fid, message_timestamp, MaterializeError, Materializer,
    ProcessingContext, ValidationError,
};
use crate::classifier::Family;
use crate::message::Message;
use crate::store::{StoreError, UserDataRow, WriteOutcome};

impl TryFrom<&Message> for UserDataRow {
    type Error = ValidationError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let body = message_data(Family::UserData, message)?
            .user_data_body
            .as_ref()
            .ok_or_else(|| ValidationError::new(Family::UserData, "user_data_body", message))?;

        let user_data_type = body
            .user_data_type
            .and_then(|user_data_type| user_data_type.code())
            .ok_or_else(|| ValidationError::new(Family::UserData, "type", message))?;
        // An empty value is how a field is cleared.
        let value = body
            .value
            .clone()
            .ok_or_else(|| ValidationError::new(Family::UserData, "value", message))?;

        Ok(UserDataRow {
            fid: message_fid(Family::UserData, message)?,
            hash: message.hash.clone(),
            timestamp: message_timestamp(Family::UserData, message)?,
            user_data_type,
            value,
        })
    }
}

/// Profile fields. The latest value per `(fid, type)` wins and there is no remove message.
pub struct UserDataMaterializer;

#[async_trait]
impl Materializer for UserDataMaterializer {
    fn family(&self) -> Family {
        Family::UserData
    }

    async fn insert_one(
        &self,
        ctx: &ProcessingContext<'_>,
        message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        let row = UserDataRow::try_from(message)?;
        let outcome = ctx.store.upsert_user_data(&row).await?;
        log_write(
            ctx,
            self.family(),
            &format!("{}:{}", row.fid, row.user_data_type),
            outcome,
        );
        Ok(outcome)
    }

    async fn delete_one(
        &self,
        _ctx: &ProcessingContext<'_>,
        _message: &Message,
    ) -> Result<WriteOutcome, MaterializeError> {
        Err(StoreError::NotTombstonable(Family::UserData).into())
    }
}
