//! An in-process `MessageStore` with the same conflict semantics as the PostgreSQL store.
//! Used by tests and for dry runs that should not touch a database.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CastRow, CheckpointStore, LinkRow, LocalRecord, MessageStore, ReactionRow, RecordKind,
    StoreError, Tombstone, TombstoneKey, UserDataRow, VerificationRow, WriteOutcome,
};
use crate::classifier::Family;
use crate::message::HexBytes;
use crate::shard::ShardKey;

/// A row together with its soft-delete marker.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow<R> {
    pub row: R,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct TombstoneRecord {
    hash: HexBytes,
    deleted_at: DateTime<Utc>,
}

trait KeyedRow: Clone {
    fn fid(&self) -> u64;
    fn hash(&self) -> &HexBytes;
    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! keyed_row {
    ($row:ty) => {
        impl KeyedRow for $row {
            fn fid(&self) -> u64 {
                self.fid
            }

            fn hash(&self) -> &HexBytes {
                &self.hash
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

keyed_row!(CastRow);
keyed_row!(ReactionRow);
keyed_row!(LinkRow);
keyed_row!(VerificationRow);

/// Rows keyed by `(fid, target_key)`.
type Table<R> = HashMap<(u64, String), StoredRow<R>>;

#[derive(Default)]
struct State {
    casts: Table<CastRow>,
    reactions: Table<ReactionRow>,
    links: Table<LinkRow>,
    verifications: Table<VerificationRow>,
    user_data: HashMap<(u64, i16), UserDataRow>,
    tombstones: HashMap<(Family, u64, String), TombstoneRecord>,
    checkpoints: HashMap<ShardKey, u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("poisoned MemoryStore mutex");
        f(&mut state)
    }

    pub fn cast(&self, hash: &HexBytes) -> Option<StoredRow<CastRow>> {
        self.with_state(|state| {
            state
                .casts
                .values()
                .find(|stored| &stored.row.hash == hash)
                .cloned()
        })
    }

    pub fn reactions(&self, fid: u64) -> Vec<StoredRow<ReactionRow>> {
        self.with_state(|state| rows_for(&state.reactions, fid))
    }

    pub fn links(&self, fid: u64) -> Vec<StoredRow<LinkRow>> {
        self.with_state(|state| rows_for(&state.links, fid))
    }

    pub fn verifications(&self, fid: u64) -> Vec<StoredRow<VerificationRow>> {
        self.with_state(|state| rows_for(&state.verifications, fid))
    }

    pub fn user_data(&self, fid: u64, user_data_type: i16) -> Option<UserDataRow> {
        self.with_state(|state| state.user_data.get(&(fid, user_data_type)).cloned())
    }

    /// Total number of rows across every family table.
    pub fn row_count(&self) -> usize {
        self.with_state(|state| {
            state.casts.len()
                + state.reactions.len()
                + state.links.len()
                + state.verifications.len()
                + state.user_data.len()
        })
    }
}

fn rows_for<R: KeyedRow>(table: &Table<R>, fid: u64) -> Vec<StoredRow<R>> {
    let mut rows: Vec<StoredRow<R>> = table
        .iter()
        .filter(|((row_fid, _), _)| *row_fid == fid)
        .map(|(_, stored)| stored.clone())
        .collect();
    rows.sort_by_key(|stored| stored.row.timestamp());
    rows
}

fn insert_keyed<R: KeyedRow>(
    table: &mut Table<R>,
    tombstones: &HashMap<(Family, u64, String), TombstoneRecord>,
    (name, family): (&str, Family),
    key: &TombstoneKey,
    row: &R,
) -> Result<WriteOutcome, StoreError> {
    let encoded = key.encode();
    let duplicate = table
        .iter()
        .find(|(_, stored)| stored.row.hash() == row.hash())
        .map(|(existing_key, _)| existing_key.clone());
    match duplicate {
        Some(existing_key) if existing_key == (row.fid(), encoded.clone()) => {
            return Ok(WriteOutcome::Unchanged)
        }
        Some(_) => {
            return Err(StoreError::ConstraintViolation {
                table: name.to_owned(),
                constraint: format!("{name}_hash_unique"),
            })
        }
        None => (),
    }

    let covered_at = tombstones
        .get(&(family, row.fid(), encoded.clone()))
        .map(|tombstone| tombstone.deleted_at)
        .filter(|deleted_at| key.is_exact() || *deleted_at >= row.timestamp());

    Ok(match table.get_mut(&(row.fid(), encoded.clone())) {
        Some(existing) => match existing.deleted_at {
            Some(deleted_at) if covered_at.is_none() && row.timestamp() > deleted_at => {
                existing.row = row.clone();
                existing.deleted_at = None;
                WriteOutcome::Revived
            }
            _ => WriteOutcome::Unchanged,
        },
        None => {
            table.insert(
                (row.fid(), encoded),
                StoredRow {
                    row: row.clone(),
                    deleted_at: covered_at,
                },
            );
            WriteOutcome::Inserted {
                deleted: covered_at.is_some(),
            }
        }
    })
}

fn tombstone_keyed<R: KeyedRow>(table: &mut Table<R>, tombstone: &Tombstone) -> WriteOutcome {
    match table.get_mut(&(tombstone.fid, tombstone.key.encode())) {
        None => WriteOutcome::TombstonePending,
        Some(existing) if existing.deleted_at.is_some() => WriteOutcome::Unchanged,
        Some(existing)
            if tombstone.key.is_exact() || existing.row.timestamp() <= tombstone.deleted_at =>
        {
            existing.deleted_at = Some(tombstone.deleted_at);
            WriteOutcome::Tombstoned
        }
        Some(_) => WriteOutcome::Unchanged,
    }
}

fn records_for<R: KeyedRow>(table: &Table<R>, family: Family, fid: u64) -> Vec<LocalRecord> {
    let mut records: Vec<(DateTime<Utc>, LocalRecord)> = table
        .iter()
        .filter(|((row_fid, _), _)| *row_fid == fid)
        .map(|((_, key), stored)| {
            let record = LocalRecord {
                family,
                key: key.clone(),
                hash: stored.row.hash().clone(),
                kind: RecordKind::Row,
                deleted: stored.deleted_at.is_some(),
            };
            (stored.row.timestamp(), record)
        })
        .collect();
    records.sort_by_key(|(timestamp, _)| *timestamp);
    records.into_iter().map(|(_, record)| record).collect()
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_cast(&self, row: &CastRow) -> Result<WriteOutcome, StoreError> {
        let key = row.key();
        self.with_state(|state| {
            insert_keyed(
                &mut state.casts,
                &state.tombstones,
                ("casts", Family::Cast),
                &key,
                row,
            )
        })
    }

    async fn insert_reaction(&self, row: &ReactionRow) -> Result<WriteOutcome, StoreError> {
        let key = row.key();
        self.with_state(|state| {
            insert_keyed(
                &mut state.reactions,
                &state.tombstones,
                ("reactions", Family::Reaction),
                &key,
                row,
            )
        })
    }

    async fn insert_link(&self, row: &LinkRow) -> Result<WriteOutcome, StoreError> {
        let key = row.key();
        self.with_state(|state| {
            insert_keyed(
                &mut state.links,
                &state.tombstones,
                ("links", Family::Link),
                &key,
                row,
            )
        })
    }

    async fn upsert_user_data(&self, row: &UserDataRow) -> Result<WriteOutcome, StoreError> {
        Ok(self.with_state(|state| {
            match state.user_data.get_mut(&(row.fid, row.user_data_type)) {
                None => {
                    state
                        .user_data
                        .insert((row.fid, row.user_data_type), row.clone());
                    WriteOutcome::Inserted { deleted: false }
                }
                Some(existing) if (&row.timestamp, &row.hash) > (&existing.timestamp, &existing.hash) => {
                    existing.hash = row.hash.clone();
                    existing.timestamp = row.timestamp;
                    existing.value = row.value.clone();
                    WriteOutcome::Overwritten
                }
                Some(_) => WriteOutcome::Unchanged,
            }
        }))
    }

    async fn insert_verification(
        &self,
        row: &VerificationRow,
    ) -> Result<WriteOutcome, StoreError> {
        let key = row.key();
        self.with_state(|state| {
            insert_keyed(
                &mut state.verifications,
                &state.tombstones,
                ("verifications", Family::Verification),
                &key,
                row,
            )
        })
    }

    async fn tombstone(&self, tombstone: &Tombstone) -> Result<WriteOutcome, StoreError> {
        if tombstone.family == Family::UserData {
            return Err(StoreError::NotTombstonable(tombstone.family));
        }

        Ok(self.with_state(|state| {
            state
                .tombstones
                .entry((tombstone.family, tombstone.fid, tombstone.key.encode()))
                .and_modify(|recorded| {
                    if tombstone.deleted_at > recorded.deleted_at {
                        recorded.deleted_at = tombstone.deleted_at;
                        recorded.hash = tombstone.hash.clone();
                    }
                })
                .or_insert_with(|| TombstoneRecord {
                    hash: tombstone.hash.clone(),
                    deleted_at: tombstone.deleted_at,
                });

            match tombstone.family {
                Family::Cast => tombstone_keyed(&mut state.casts, tombstone),
                Family::Reaction => tombstone_keyed(&mut state.reactions, tombstone),
                Family::Link => tombstone_keyed(&mut state.links, tombstone),
                Family::Verification => tombstone_keyed(&mut state.verifications, tombstone),
                Family::UserData => WriteOutcome::Unchanged,
            }
        }))
    }

    async fn local_records(&self, fid: u64) -> Result<Vec<LocalRecord>, StoreError> {
        Ok(self.with_state(|state| {
            let mut records = records_for(&state.casts, Family::Cast, fid);
            records.extend(records_for(&state.reactions, Family::Reaction, fid));
            records.extend(records_for(&state.links, Family::Link, fid));
            records.extend(records_for(&state.verifications, Family::Verification, fid));
            records.extend(
                state
                    .user_data
                    .values()
                    .filter(|row| row.fid == fid)
                    .map(|row| LocalRecord {
                        family: Family::UserData,
                        key: row.user_data_type.to_string(),
                        hash: row.hash.clone(),
                        kind: RecordKind::Row,
                        deleted: false,
                    }),
            );
            records.extend(
                state
                    .tombstones
                    .iter()
                    .filter(|((_, tombstone_fid, _), _)| *tombstone_fid == fid)
                    .map(|((family, _, key), recorded)| LocalRecord {
                        family: *family,
                        key: key.clone(),
                        hash: recorded.hash.clone(),
                        kind: RecordKind::Tombstone,
                        deleted: true,
                    }),
            );
            records
        }))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, shard: &ShardKey) -> Result<Option<u64>, StoreError> {
        Ok(self.with_state(|state| state.checkpoints.get(shard).copied()))
    }

    async fn save_checkpoint(&self, shard: &ShardKey, position: u64) -> Result<(), StoreError> {
        self.with_state(|state| {
            let current = state.checkpoints.entry(shard.clone()).or_insert(position);
            *current = (*current).max(position);
        });
        Ok(())
    }
}
