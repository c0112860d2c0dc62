//! # Classifier
//!
//! Routes a message observation to the entity family that owns it and to the mutation it implies.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::events::{MessageState, Operation};
use crate::message::{Message, MessageType};

/// The entity families materialized into their own tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Cast,
    Reaction,
    Link,
    UserData,
    Verification,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Cast => "cast",
            Family::Reaction => "reaction",
            Family::Link => "link",
            Family::UserData => "user_data",
            Family::Verification => "verification",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseFamilyError(pub String);

impl FromStr for Family {
    type Err = ParseFamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cast" => Ok(Family::Cast),
            "reaction" => Ok(Family::Reaction),
            "link" => Ok(Family::Link),
            "user_data" => Ok(Family::UserData),
            "verification" => Ok(Family::Verification),
            invalid => Err(ParseFamilyError(invalid.to_owned())),
        }
    }
}

/// Why an observation does not translate into a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// An add deleted by an explicit remove: the remove message carries the tombstone.
    CoveredByRemove,
    /// A remove that was itself superseded by a newer add. The add is delivered separately.
    Superseded,
    /// Upstream pruned the message. Not applied; surfaced by reconciliation.
    Pruned,
    /// Upstream revoked the message's signer. Not applied; surfaced by reconciliation.
    Revoked,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::CoveredByRemove => "covered_by_remove",
            IgnoreReason::Superseded => "superseded",
            IgnoreReason::Pruned => "pruned",
            IgnoreReason::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Insert (or, for mutable families, upsert) the row keyed by this message.
    Insert,
    /// Tombstone the row referenced by this remove message.
    Delete,
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub family: Family,
    pub action: Action,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("message handler not implemented for this message type: {0:?}")]
    UnmappedMessageType(MessageType),
    #[error("message has no data")]
    MissingData,
}

/// What to do with messages the classifier cannot map to a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmappedPolicy {
    /// Abort processing with an error.
    #[default]
    Fail,
    /// Log, count in `shuttle_unmapped_messages_total` and move on.
    Skip,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseUnmappedPolicyError(pub String);

impl fmt::Display for ParseUnmappedPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a valid policy, expected fail or skip", self.0)
    }
}

impl FromStr for UnmappedPolicy {
    type Err = ParseUnmappedPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "fail" => Ok(UnmappedPolicy::Fail),
            "skip" => Ok(UnmappedPolicy::Skip),
            invalid => Err(ParseUnmappedPolicyError(invalid.to_owned())),
        }
    }
}

/// Classify a message observation.
///
/// Families with an add/remove pair use the lifecycle state to pick between insert and tombstone.
/// UserData has no remove: every observation of it is an upsert, except upstream prunes and
/// revokes which are never applied automatically.
pub fn classify(
    message: &Message,
    operation: Operation,
    state: MessageState,
) -> Result<Route, ClassifyError> {
    let message_type = message.message_type().ok_or(ClassifyError::MissingData)?;

    let family = match message_type {
        MessageType::CastAdd | MessageType::CastRemove => Family::Cast,
        MessageType::ReactionAdd | MessageType::ReactionRemove => Family::Reaction,
        MessageType::LinkAdd | MessageType::LinkRemove => Family::Link,
        MessageType::UserDataAdd => Family::UserData,
        MessageType::VerificationAddAddress | MessageType::VerificationRemove => {
            Family::Verification
        }
        MessageType::LinkCompactState
        | MessageType::UsernameProof
        | MessageType::FrameAction
        | MessageType::Unknown => return Err(ClassifyError::UnmappedMessageType(message_type)),
    };

    let action = match (operation, state) {
        (Operation::Prune, _) => Action::Ignore(IgnoreReason::Pruned),
        (Operation::Revoke, _) => Action::Ignore(IgnoreReason::Revoked),
        _ if family == Family::UserData => Action::Insert,
        (Operation::Merge, MessageState::Created) if message_type.is_add() => Action::Insert,
        (_, MessageState::Deleted) if message_type.is_add() => {
            Action::Ignore(IgnoreReason::CoveredByRemove)
        }
        (Operation::Delete, _) => Action::Ignore(IgnoreReason::Superseded),
        (Operation::Merge, _) => Action::Delete,
    };

    Ok(Route { family, action })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageData;

    fn message(message_type: MessageType) -> Message {
        Message {
            data: Some(MessageData::new(message_type, 1, 10)),
            hash: vec![0xaa].into(),
        }
    }

    #[test]
    fn test_adds_created_are_inserted() {
        for (message_type, family) in [
            (MessageType::CastAdd, Family::Cast),
            (MessageType::ReactionAdd, Family::Reaction),
            (MessageType::LinkAdd, Family::Link),
            (MessageType::UserDataAdd, Family::UserData),
            (MessageType::VerificationAddAddress, Family::Verification),
        ] {
            let route = classify(
                &message(message_type),
                Operation::Merge,
                MessageState::Created,
            )
            .unwrap();
            assert_eq!(
                route,
                Route {
                    family,
                    action: Action::Insert
                }
            );
        }
    }

    #[test]
    fn test_removes_are_tombstones() {
        for (message_type, family) in [
            (MessageType::CastRemove, Family::Cast),
            (MessageType::ReactionRemove, Family::Reaction),
            (MessageType::LinkRemove, Family::Link),
            (MessageType::VerificationRemove, Family::Verification),
        ] {
            let route = classify(
                &message(message_type),
                Operation::Merge,
                MessageState::Deleted,
            )
            .unwrap();
            assert_eq!(
                route,
                Route {
                    family,
                    action: Action::Delete
                }
            );
        }
    }

    #[test]
    fn test_deleted_add_is_left_to_its_remove() {
        let route = classify(
            &message(MessageType::CastAdd),
            Operation::Delete,
            MessageState::Deleted,
        )
        .unwrap();
        assert_eq!(route.action, Action::Ignore(IgnoreReason::CoveredByRemove));
    }

    #[test]
    fn test_superseded_remove_is_ignored() {
        let route = classify(
            &message(MessageType::ReactionRemove),
            Operation::Delete,
            MessageState::Deleted,
        )
        .unwrap();
        assert_eq!(route.action, Action::Ignore(IgnoreReason::Superseded));
    }

    #[test]
    fn test_user_data_is_upserted_regardless_of_state() {
        for state in [MessageState::Created, MessageState::Deleted] {
            let route = classify(&message(MessageType::UserDataAdd), Operation::Delete, state)
                .unwrap();
            assert_eq!(route.action, Action::Insert);
        }
    }

    #[test]
    fn test_prune_and_revoke_are_never_applied() {
        for message_type in [MessageType::CastAdd, MessageType::UserDataAdd] {
            let pruned =
                classify(&message(message_type), Operation::Prune, MessageState::Deleted).unwrap();
            assert_eq!(pruned.action, Action::Ignore(IgnoreReason::Pruned));

            let revoked =
                classify(&message(message_type), Operation::Revoke, MessageState::Deleted).unwrap();
            assert_eq!(revoked.action, Action::Ignore(IgnoreReason::Revoked));
        }
    }

    #[test]
    fn test_unmapped_message_types() {
        for message_type in [
            MessageType::UsernameProof,
            MessageType::FrameAction,
            MessageType::LinkCompactState,
            MessageType::Unknown,
        ] {
            let result = classify(&message(message_type), Operation::Merge, MessageState::Created);
            assert_eq!(result, Err(ClassifyError::UnmappedMessageType(message_type)));
        }

        let no_data = Message {
            data: None,
            hash: vec![0x01].into(),
        };
        assert_eq!(
            classify(&no_data, Operation::Merge, MessageState::Created),
            Err(ClassifyError::MissingData)
        );
    }

    #[test]
    fn test_parse_unmapped_policy() {
        assert_eq!("fail".parse::<UnmappedPolicy>(), Ok(UnmappedPolicy::Fail));
        assert_eq!(" Skip ".parse::<UnmappedPolicy>(), Ok(UnmappedPolicy::Skip));
        assert!("ignore".parse::<UnmappedPolicy>().is_err());
    }
}
