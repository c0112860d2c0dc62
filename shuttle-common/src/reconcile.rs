//! # Reconcile
//!
//! Repairs drift between the hub and the local mirror, one identity at a time. Missing messages
//! are replayed through the same writer as live events. Upstream prunes and revokes are reported,
//! never applied.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::classifier::Family;
use crate::events::{MessageState, Operation, StoreEvent};
use crate::hub::{HubClient, HubError};
use crate::materializer::{
    record_key, Disposition, MaterializeError, MessageWriter, ProcessingContext,
};
use crate::message::{HexBytes, Message};
use crate::store::{LocalRecord, MessageStore, RecordKind, StoreError, WriteOutcome};
use crate::time::TimeSource;

/// One message of the authoritative set, with what the hub knows about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileEntry {
    pub message: Message,
    /// The hub knows the mirror never received this message.
    pub missing_locally: bool,
    pub pruned: bool,
    pub revoked: bool,
}

impl ReconcileEntry {
    /// A message in the hub's live state.
    pub fn active(message: Message) -> Self {
        Self {
            message,
            missing_locally: false,
            pruned: false,
            revoked: false,
        }
    }

    fn sort_key(&self) -> (u32, bool) {
        (
            self.message.timestamp().unwrap_or_default(),
            !self.message.is_add(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    /// Pruned upstream, still active locally.
    PrunedUpstream,
    /// Revoked upstream, still active locally.
    RevokedUpstream,
    /// Active locally, unknown to the hub.
    LocalOnly,
}

impl DivergenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivergenceKind::PrunedUpstream => "pruned_upstream",
            DivergenceKind::RevokedUpstream => "revoked_upstream",
            DivergenceKind::LocalOnly => "local_only",
        }
    }
}

impl fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub family: Family,
    pub hash: HexBytes,
    pub kind: DivergenceKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub fid: u64,
    /// Size of the authoritative set.
    pub authoritative: usize,
    /// Messages replayed through the writer.
    pub replayed: usize,
    /// Replayed messages that changed local state.
    pub applied: usize,
    pub divergences: Vec<Divergence>,
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("failed to fetch authoritative state: {0}")]
    Hub(#[from] HubError),
    #[error("failed to read local state: {0}")]
    Store(#[from] StoreError),
    #[error("failed to replay message: {0}")]
    Materialize(#[from] MaterializeError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Hub(error) => error.is_retryable(),
            ReconcileError::Store(StoreError::QueryError { .. })
            | ReconcileError::Store(StoreError::PoolCreationError { .. })
            | ReconcileError::Materialize(MaterializeError::Store(StoreError::QueryError { .. })) => {
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    hub: Arc<dyn HubClient>,
    store: Arc<dyn MessageStore>,
    writer: Arc<MessageWriter>,
    clock: Arc<dyn TimeSource>,
}

impl Reconciler {
    pub fn new(
        hub: Arc<dyn HubClient>,
        store: Arc<dyn MessageStore>,
        writer: Arc<MessageWriter>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            hub,
            store,
            writer,
            clock,
        }
    }

    /// Diff and repair one identity.
    ///
    /// Authoritative entries are matched to local records by family and semantic key, so a row
    /// kept by a composite-key dedupe under an earlier hash still counts as present. Divergences
    /// are computed after the replay, against the repaired state.
    pub async fn reconcile_fid(&self, fid: u64) -> Result<ReconcileReport, ReconcileError> {
        let span = info_span!("reconcile", fid);
        let entries = self.hub.full_message_set(fid).await?;
        let local = self.store.local_records(fid).await?;

        let mut report = ReconcileReport {
            fid,
            authoritative: entries.len(),
            ..Default::default()
        };

        let keyed: Vec<(&ReconcileEntry, Option<(Family, String)>)> = entries
            .iter()
            .map(|entry| (entry, record_key(&entry.message, self.clock.as_ref())))
            .collect();

        let mut replay: Vec<&ReconcileEntry> = {
            let index = LocalIndex::new(&local);
            keyed
                .iter()
                .filter(|(entry, _)| !entry.pruned && !entry.revoked)
                .filter(|(entry, key)| entry.missing_locally || !index.holds(entry, key.as_ref()))
                .map(|(entry, _)| *entry)
                .collect()
        };
        replay.sort_by_key(|entry| entry.sort_key());

        let ctx = ProcessingContext::new(self.store.as_ref(), self.clock.as_ref(), span.clone());
        for entry in replay {
            let event = StoreEvent {
                event_id: 0,
                message: entry.message.clone(),
                operation: Operation::Merge,
                state: MessageState::for_merged(&entry.message),
                is_new: true,
                was_missed: true,
            };

            let disposition = self.writer.write_message(&ctx, &event).await?;
            report.replayed += 1;
            if let Disposition::Applied { outcome, .. } = disposition {
                if outcome != WriteOutcome::Unchanged {
                    report.applied += 1;
                }
            }
        }

        let repaired = if report.applied > 0 {
            self.store.local_records(fid).await?
        } else {
            local
        };
        report.divergences = divergences(&keyed, &repaired);

        for divergence in &report.divergences {
            warn!(
                parent: &span,
                family = divergence.family.as_str(),
                hash = %divergence.hash,
                kind = divergence.kind.as_str(),
                "local state diverges from hub, not repairing"
            );
            metrics::counter!("shuttle_reconcile_divergences_total", "kind" => divergence.kind.as_str())
                .increment(1);
        }
        metrics::counter!("shuttle_reconcile_replayed_total").increment(report.replayed as u64);

        info!(
            parent: &span,
            authoritative = report.authoritative,
            replayed = report.replayed,
            applied = report.applied,
            divergences = report.divergences.len(),
            "reconciled fid"
        );

        Ok(report)
    }
}

/// Local records looked up by hash and by `(family, key)`.
struct LocalIndex<'a> {
    hashes: HashSet<&'a HexBytes>,
    rows: HashMap<(Family, &'a str), &'a LocalRecord>,
    tombstones: HashSet<(Family, &'a str)>,
}

impl<'a> LocalIndex<'a> {
    fn new(local: &'a [LocalRecord]) -> Self {
        let mut index = LocalIndex {
            hashes: HashSet::new(),
            rows: HashMap::new(),
            tombstones: HashSet::new(),
        };
        for record in local {
            index.hashes.insert(&record.hash);
            match record.kind {
                RecordKind::Row => {
                    index.rows.insert((record.family, record.key.as_str()), record);
                }
                RecordKind::Tombstone => {
                    index.tombstones.insert((record.family, record.key.as_str()));
                }
            }
        }
        index
    }

    fn row(&self, key: &(Family, String)) -> Option<&'a LocalRecord> {
        self.rows.get(&(key.0, key.1.as_str())).copied()
    }

    /// Whether replaying `entry` could not change local state.
    fn holds(&self, entry: &ReconcileEntry, key: Option<&(Family, String)>) -> bool {
        let message = &entry.message;
        let Some(key) = key else {
            return self.hashes.contains(&message.hash);
        };

        if !message.is_add() {
            return self.tombstones.contains(&(key.0, key.1.as_str()));
        }

        // Keyed families keep the first active add for a key; user data keeps the latest value.
        self.row(key).is_some_and(|row| {
            row.hash == message.hash || (key.0 != Family::UserData && !row.deleted)
        })
    }
}

fn divergences(
    keyed: &[(&ReconcileEntry, Option<(Family, String)>)],
    local: &[LocalRecord],
) -> Vec<Divergence> {
    let index = LocalIndex::new(local);
    let mut divergences = Vec::new();

    for (entry, key) in keyed.iter().filter(|(entry, _)| entry.pruned || entry.revoked) {
        let record = match key {
            Some(key) => index.row(key),
            None => local
                .iter()
                .find(|record| record.kind == RecordKind::Row && record.hash == entry.message.hash),
        };
        let Some(record) = record.filter(|record| !record.deleted) else {
            continue;
        };

        let kind = if entry.revoked {
            DivergenceKind::RevokedUpstream
        } else {
            DivergenceKind::PrunedUpstream
        };
        divergences.push(Divergence {
            family: record.family,
            hash: record.hash.clone(),
            kind,
        });
    }

    let upstream_keys: HashSet<(Family, &str)> = keyed
        .iter()
        .filter(|(entry, _)| entry.message.is_add())
        .filter_map(|(_, key)| key.as_ref().map(|(family, key)| (*family, key.as_str())))
        .collect();
    let upstream_hashes: HashSet<&HexBytes> =
        keyed.iter().map(|(entry, _)| &entry.message.hash).collect();

    for record in local.iter().filter(|record| {
        record.kind == RecordKind::Row
            && !record.deleted
            && !upstream_keys.contains(&(record.family, record.key.as_str()))
            && !upstream_hashes.contains(&record.hash)
    }) {
        divergences.push(Divergence {
            family: record.family,
            hash: record.hash.clone(),
            kind: DivergenceKind::LocalOnly,
        });
    }

    divergences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::UnmappedPolicy;
    use crate::store::memory::MemoryStore;
    use crate::test_utils::{
        cast_add, cast_remove, link_add, reaction_add, user_data_add, MockHub, TestClock,
    };

    fn reconciler(hub: MockHub, store: Arc<MemoryStore>) -> Reconciler {
        Reconciler::new(
            Arc::new(hub),
            store,
            Arc::new(MessageWriter::new(UnmappedPolicy::Fail)),
            Arc::new(TestClock),
        )
    }

    async fn sorted_records(store: &MemoryStore, fid: u64) -> Vec<(Family, HexBytes, bool)> {
        let mut records: Vec<_> = store
            .local_records(fid)
            .await
            .unwrap()
            .into_iter()
            .map(|record| (record.family, record.hash, record.deleted))
            .collect();
        records.sort();
        records
    }

    #[tokio::test]
    async fn test_reconcile_converges_with_live_processing() {
        let messages = vec![
            cast_add(1, 0xa1, 10, "first"),
            cast_add(1, 0xa2, 11, "second"),
            cast_remove(1, 0xa3, 12, 0xa1),
            reaction_add(1, 0xa4, 13, 1, 0xff),
            link_add(1, 0xa5, 14, "follow", 2),
            user_data_add(1, 0xa6, 15, 6, "alice"),
        ];

        // Everything delivered live.
        let live = Arc::new(MemoryStore::new());
        let writer = MessageWriter::new(UnmappedPolicy::Fail);
        let ctx = ProcessingContext::new(live.as_ref(), &TestClock, tracing::Span::none());
        for message in &messages {
            writer
                .write_message(&ctx, &StoreEvent::merged(1, message.clone()))
                .await
                .unwrap();
        }

        // Only the first cast delivered live, the rest recovered by reconciliation.
        let partial = Arc::new(MemoryStore::new());
        let ctx = ProcessingContext::new(partial.as_ref(), &TestClock, tracing::Span::none());
        writer
            .write_message(&ctx, &StoreEvent::merged(1, messages[0].clone()))
            .await
            .unwrap();

        let hub = MockHub::default().with_messages(
            1,
            messages.iter().cloned().map(ReconcileEntry::active).collect(),
        );
        let report = reconciler(hub, partial.clone())
            .reconcile_fid(1)
            .await
            .unwrap();

        assert_eq!(report.authoritative, 6);
        assert_eq!(report.replayed, 5);
        assert_eq!(report.applied, 5);
        assert!(report.divergences.is_empty());
        assert_eq!(
            sorted_records(&partial, 1).await,
            sorted_records(&live, 1).await
        );
    }

    #[tokio::test]
    async fn test_reconcile_twice_replays_nothing() {
        let store = Arc::new(MemoryStore::new());
        let hub = MockHub::default().with_messages(
            1,
            vec![ReconcileEntry::active(cast_add(1, 0xa1, 10, "first"))],
        );
        let reconciler = reconciler(hub, store.clone());

        let first = reconciler.reconcile_fid(1).await.unwrap();
        let second = reconciler.reconcile_fid(1).await.unwrap();

        assert_eq!(first.replayed, 1);
        assert_eq!(second.replayed, 0);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_locally_flag_forces_replay() {
        let store = Arc::new(MemoryStore::new());
        let message = cast_add(1, 0xa1, 10, "first");
        let ctx = ProcessingContext::new(store.as_ref(), &TestClock, tracing::Span::none());
        MessageWriter::new(UnmappedPolicy::Fail)
            .write_message(&ctx, &StoreEvent::merged(1, message.clone()))
            .await
            .unwrap();

        let mut entry = ReconcileEntry::active(message);
        entry.missing_locally = true;
        let report = reconciler(MockHub::default().with_messages(1, vec![entry]), store)
            .reconcile_fid(1)
            .await
            .unwrap();

        assert_eq!(report.replayed, 1);
        assert_eq!(report.applied, 0);
    }

    #[tokio::test]
    async fn test_pruned_and_local_only_rows_are_reported_not_repaired() {
        let store = Arc::new(MemoryStore::new());
        let pruned = cast_add(1, 0xa1, 10, "pruned");
        let local_only = cast_add(1, 0xa2, 11, "local only");
        let ctx = ProcessingContext::new(store.as_ref(), &TestClock, tracing::Span::none());
        let writer = MessageWriter::new(UnmappedPolicy::Fail);
        for message in [&pruned, &local_only] {
            writer
                .write_message(&ctx, &StoreEvent::merged(1, message.clone()))
                .await
                .unwrap();
        }

        let mut entry = ReconcileEntry::active(pruned);
        entry.pruned = true;
        let report = reconciler(MockHub::default().with_messages(1, vec![entry]), store.clone())
            .reconcile_fid(1)
            .await
            .unwrap();

        assert_eq!(report.replayed, 0);
        assert_eq!(
            report.divergences,
            vec![
                Divergence {
                    family: Family::Cast,
                    hash: HexBytes(vec![0xa1]),
                    kind: DivergenceKind::PrunedUpstream,
                },
                Divergence {
                    family: Family::Cast,
                    hash: HexBytes(vec![0xa2]),
                    kind: DivergenceKind::LocalOnly,
                },
            ]
        );
        assert!(store.cast(&HexBytes(vec![0xa1])).unwrap().deleted_at.is_none());
        assert!(store.cast(&HexBytes(vec![0xa2])).unwrap().deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_deduplicated_reaction_is_not_a_divergence() {
        let store = Arc::new(MemoryStore::new());
        let first = reaction_add(2, 0x01, 10, 1, 0xaa);
        let second = reaction_add(2, 0x02, 11, 1, 0xaa);

        // The hub replaced the first like with the second, the mirror kept the first.
        let ctx = ProcessingContext::new(store.as_ref(), &TestClock, tracing::Span::none());
        let writer = MessageWriter::new(UnmappedPolicy::Fail);
        for event in [
            StoreEvent::merged(1, first.clone()),
            StoreEvent::deleted(2, first, Operation::Delete),
            StoreEvent::merged(2, second.clone()),
        ] {
            writer.handle_event(&ctx, &event).await.unwrap();
        }

        let hub = MockHub::default().with_messages(2, vec![ReconcileEntry::active(second)]);
        let reconciler = reconciler(hub, store.clone());

        for _ in 0..2 {
            let report = reconciler.reconcile_fid(2).await.unwrap();
            assert_eq!(report.replayed, 0);
            assert!(report.divergences.is_empty(), "{:?}", report.divergences);
        }
        assert_eq!(store.reactions(2).len(), 1);
        assert_eq!(store.reactions(2)[0].row.hash, HexBytes(vec![0x01]));
    }

    #[tokio::test]
    async fn test_missed_cast_remove_is_repaired() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ProcessingContext::new(store.as_ref(), &TestClock, tracing::Span::none());
        MessageWriter::new(UnmappedPolicy::Fail)
            .write_message(&ctx, &StoreEvent::merged(1, cast_add(1, 0xa1, 10, "gone")))
            .await
            .unwrap();

        // The hub no longer holds the add, only the remove the mirror never received.
        let hub = MockHub::default().with_messages(
            1,
            vec![ReconcileEntry::active(cast_remove(1, 0xa2, 12, 0xa1))],
        );
        let reconciler = reconciler(hub, store.clone());

        let first = reconciler.reconcile_fid(1).await.unwrap();
        let second = reconciler.reconcile_fid(1).await.unwrap();

        assert_eq!((first.replayed, first.applied), (1, 1));
        assert!(first.divergences.is_empty());
        assert_eq!(second.replayed, 0);
        assert!(second.divergences.is_empty());
        assert!(store.cast(&HexBytes(vec![0xa1])).unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_missed_user_data_update_is_replayed() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ProcessingContext::new(store.as_ref(), &TestClock, tracing::Span::none());
        MessageWriter::new(UnmappedPolicy::Fail)
            .write_message(&ctx, &StoreEvent::merged(1, user_data_add(1, 0x01, 10, 6, "alice")))
            .await
            .unwrap();

        let hub = MockHub::default().with_messages(
            1,
            vec![ReconcileEntry::active(user_data_add(1, 0x02, 20, 6, "bob"))],
        );
        let report = reconciler(hub, store.clone()).reconcile_fid(1).await.unwrap();

        assert_eq!((report.replayed, report.applied), (1, 1));
        assert!(report.divergences.is_empty());
        assert_eq!(store.user_data(1, 6).unwrap().value, "bob");
    }

    #[tokio::test]
    async fn test_hub_failure_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let hub = MockHub::default().unavailable();

        let error = reconciler(hub, store).reconcile_fid(1).await.unwrap_err();

        assert!(error.is_retryable());
    }
}
