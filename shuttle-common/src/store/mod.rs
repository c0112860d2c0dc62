//! # Store
//!
//! Rows produced by the materializers and the storage seam they are written through.
//!
//! Every write method is atomic with conflict-aware semantics: re-applying a write is a no-op, or
//! a defined merge for `user_data`. Writes to the same key are serialized, so an add and its
//! remove racing each other still end with the row deleted.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::classifier::Family;
use crate::message::HexBytes;
use crate::shard::ShardKey;

pub mod memory;
pub mod postgres;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{table} write violated constraint {constraint}")]
    ConstraintViolation { table: String, constraint: String },
    #[error("migrations failed to apply: {0}")]
    MigrationFailure(#[from] sqlx::migrate::MigrateError),
    #[error("{0} is not a valid family")]
    UnknownFamily(String),
    #[error("{0} rows have no remove and cannot be tombstoned")]
    NotTombstonable(Family),
}

/// The result of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row was created. `deleted` is set when a tombstone recorded earlier already covered it.
    Inserted { deleted: bool },
    /// A tombstoned row was replaced by a strictly newer add for the same key.
    Revived,
    /// The value of a mutable row was replaced by a newer one.
    Overwritten,
    /// An active row was marked deleted.
    Tombstoned,
    /// No row exists yet; the tombstone was recorded and will cover the add when it arrives.
    TombstonePending,
    /// Nothing changed: a duplicate, an older value, or an already applied tombstone.
    Unchanged,
}

impl WriteOutcome {
    /// Lifecycle state of the row after this write, for logging.
    pub fn lifecycle(&self) -> &'static str {
        match self {
            WriteOutcome::Inserted { deleted: false }
            | WriteOutcome::Revived
            | WriteOutcome::Overwritten => "active",
            WriteOutcome::Inserted { deleted: true } | WriteOutcome::Tombstoned => "deleted",
            WriteOutcome::TombstonePending => "pending",
            WriteOutcome::Unchanged => "unchanged",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Inserted { .. } => "inserted",
            WriteOutcome::Revived => "revived",
            WriteOutcome::Overwritten => "overwritten",
            WriteOutcome::Tombstoned => "tombstoned",
            WriteOutcome::TombstonePending => "tombstone_pending",
            WriteOutcome::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CastRow {
    pub fid: u64,
    pub hash: HexBytes,
    pub timestamp: DateTime<Utc>,
    pub parent_fid: Option<u64>,
    pub parent_hash: Option<HexBytes>,
    pub parent_url: Option<String>,
    pub text: String,
    pub embeds: serde_json::Value,
    pub mentions: serde_json::Value,
    pub mentions_positions: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReactionTarget {
    Cast { fid: u64, hash: HexBytes },
    Url(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionRow {
    pub fid: u64,
    pub hash: HexBytes,
    pub timestamp: DateTime<Utc>,
    pub reaction_type: i16,
    pub target: ReactionTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkRow {
    pub fid: u64,
    pub hash: HexBytes,
    pub timestamp: DateTime<Utc>,
    pub link_type: String,
    pub target_fid: u64,
    pub display_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserDataRow {
    pub fid: u64,
    pub hash: HexBytes,
    pub timestamp: DateTime<Utc>,
    pub user_data_type: i16,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRow {
    pub fid: u64,
    pub hash: HexBytes,
    pub timestamp: DateTime<Utc>,
    pub signer_address: HexBytes,
    pub block_hash: Option<HexBytes>,
    pub signature: Option<HexBytes>,
    pub protocol: i16,
}

/// The key a remove message refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TombstoneKey {
    /// Casts are removed by the hash of the add.
    Hash(HexBytes),
    Reaction {
        reaction_type: i16,
        target: ReactionTarget,
    },
    Link {
        link_type: String,
        target_fid: u64,
    },
    Verification {
        address: HexBytes,
    },
}

impl TombstoneKey {
    /// Canonical text form, stored as `target_key` in the family tables and in `tombstones`.
    pub fn encode(&self) -> String {
        match self {
            TombstoneKey::Hash(hash) => hash.to_string(),
            TombstoneKey::Reaction {
                reaction_type,
                target: ReactionTarget::Cast { fid, hash },
            } => format!("{reaction_type}:cast:{fid}:{hash}"),
            TombstoneKey::Reaction {
                reaction_type,
                target: ReactionTarget::Url(url),
            } => format!("{reaction_type}:url:{url}"),
            TombstoneKey::Link {
                link_type,
                target_fid,
            } => format!("{link_type}:{target_fid}"),
            TombstoneKey::Verification { address } => address.to_string(),
        }
    }

    /// Whether a remove of this key covers adds regardless of their timestamp.
    /// Exact hashes always do; semantic keys only cover adds not later than the remove.
    pub fn is_exact(&self) -> bool {
        matches!(self, TombstoneKey::Hash(_))
    }
}

impl CastRow {
    pub fn key(&self) -> TombstoneKey {
        TombstoneKey::Hash(self.hash.clone())
    }
}

impl ReactionRow {
    pub fn key(&self) -> TombstoneKey {
        TombstoneKey::Reaction {
            reaction_type: self.reaction_type,
            target: self.target.clone(),
        }
    }
}

impl LinkRow {
    pub fn key(&self) -> TombstoneKey {
        TombstoneKey::Link {
            link_type: self.link_type.clone(),
            target_fid: self.target_fid,
        }
    }
}

impl VerificationRow {
    pub fn key(&self) -> TombstoneKey {
        TombstoneKey::Verification {
            address: self.signer_address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub family: Family,
    pub fid: u64,
    pub key: TombstoneKey,
    /// Hash of the remove message.
    pub hash: HexBytes,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A row in one of the family tables, created by an add.
    Row,
    /// A recorded remove.
    Tombstone,
}

/// What the local mirror knows about one message, for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecord {
    pub family: Family,
    /// The row's semantic key: `target_key` for keyed families, the type code for user data.
    pub key: String,
    pub hash: HexBytes,
    pub kind: RecordKind,
    pub deleted: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a cast, or do nothing if its hash is already present.
    async fn insert_cast(&self, row: &CastRow) -> Result<WriteOutcome, StoreError>;

    /// Insert a reaction, deduplicating on hash and on `(fid, type, target)`.
    async fn insert_reaction(&self, row: &ReactionRow) -> Result<WriteOutcome, StoreError>;

    /// Insert a link, deduplicating on hash and on `(fid, type, target_fid)`.
    async fn insert_link(&self, row: &LinkRow) -> Result<WriteOutcome, StoreError>;

    /// Insert or overwrite the `(fid, type)` value when the incoming row is newer.
    async fn upsert_user_data(&self, row: &UserDataRow) -> Result<WriteOutcome, StoreError>;

    /// Insert a verification, deduplicating on hash and on `(fid, address)`.
    async fn insert_verification(&self, row: &VerificationRow)
        -> Result<WriteOutcome, StoreError>;

    /// Record a remove and mark the row it covers, if present, as deleted.
    /// The delete marker is never cleared nor moved once set.
    async fn tombstone(&self, tombstone: &Tombstone) -> Result<WriteOutcome, StoreError>;

    /// Every row and tombstone held for an identity.
    async fn local_records(&self, fid: u64) -> Result<Vec<LocalRecord>, StoreError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, shard: &ShardKey) -> Result<Option<u64>, StoreError>;

    /// Persist a shard position. Positions never move backwards.
    async fn save_checkpoint(&self, shard: &ShardKey, position: u64) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_key_encoding() {
        let hash = HexBytes(vec![0xaa]);

        assert_eq!(TombstoneKey::Hash(hash.clone()).encode(), "0xaa");
        assert_eq!(
            TombstoneKey::Reaction {
                reaction_type: 1,
                target: ReactionTarget::Cast { fid: 2, hash },
            }
            .encode(),
            "1:cast:2:0xaa"
        );
        assert_eq!(
            TombstoneKey::Reaction {
                reaction_type: 2,
                target: ReactionTarget::Url("https://example.com".to_owned()),
            }
            .encode(),
            "2:url:https://example.com"
        );
        assert_eq!(
            TombstoneKey::Link {
                link_type: "follow".to_owned(),
                target_fid: 3,
            }
            .encode(),
            "follow:3"
        );
    }

    #[test]
    fn test_lifecycle() {
        assert_eq!(WriteOutcome::Inserted { deleted: false }.lifecycle(), "active");
        assert_eq!(WriteOutcome::Inserted { deleted: true }.lifecycle(), "deleted");
        assert_eq!(WriteOutcome::TombstonePending.lifecycle(), "pending");
    }
}
