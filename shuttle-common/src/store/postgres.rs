//! PostgreSQL implementation of the store traits.
//!
//! Removes are recorded in `tombstones` and the same statement marks the covered row, if it
//! exists yet. Inserts consult `tombstones` so a remove that arrived first still wins.
//!
//! Inserts and tombstones for one `(family, fid, target_key)` run in a transaction holding an
//! advisory lock on that key. Each statement then reads a snapshot taken after the other write
//! committed, never one from before it.
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::query::QueryAs;
use sqlx::types::Json;
use sqlx::Postgres;

use super::{
    CastRow, CheckpointStore, LinkRow, LocalRecord, MessageStore, ReactionRow, ReactionTarget,
    RecordKind, StoreError, Tombstone, UserDataRow, VerificationRow, WriteOutcome,
};
use crate::classifier::Family;
use crate::message::HexBytes;
use crate::shard::ShardKey;

type KeyedInsert<'q> = QueryAs<'q, Postgres, (bool, bool), PgArguments>;

const INSERT_CAST: &str = r#"
WITH covering AS (
    SELECT deleted_at FROM tombstones
    WHERE family = 'cast' AND fid = $1 AND target_key = $2
)
INSERT INTO casts
    (fid, target_key, hash, timestamp, parent_fid, parent_hash, parent_url, text, embeds, mentions, mentions_positions, deleted_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, (SELECT deleted_at FROM covering))
ON CONFLICT (fid, target_key) DO NOTHING
RETURNING (xmax = 0) AS inserted, (deleted_at IS NOT NULL) AS deleted
"#;

const INSERT_REACTION: &str = r#"
WITH covering AS (
    SELECT deleted_at FROM tombstones
    WHERE family = 'reaction' AND fid = $1 AND target_key = $2 AND deleted_at >= $4
)
INSERT INTO reactions AS existing
    (fid, target_key, hash, timestamp, type, target_cast_fid, target_cast_hash, target_url, deleted_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, (SELECT deleted_at FROM covering))
ON CONFLICT (fid, target_key) DO UPDATE SET
    hash = excluded.hash,
    timestamp = excluded.timestamp,
    deleted_at = NULL,
    updated_at = NOW()
WHERE existing.deleted_at IS NOT NULL
    AND excluded.deleted_at IS NULL
    AND excluded.timestamp > existing.deleted_at
    AND existing.hash <> excluded.hash
RETURNING (xmax = 0) AS inserted, (deleted_at IS NOT NULL) AS deleted
"#;

const INSERT_LINK: &str = r#"
WITH covering AS (
    SELECT deleted_at FROM tombstones
    WHERE family = 'link' AND fid = $1 AND target_key = $2 AND deleted_at >= $4
)
INSERT INTO links AS existing
    (fid, target_key, hash, timestamp, type, target_fid, display_timestamp, deleted_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, (SELECT deleted_at FROM covering))
ON CONFLICT (fid, target_key) DO UPDATE SET
    hash = excluded.hash,
    timestamp = excluded.timestamp,
    display_timestamp = excluded.display_timestamp,
    deleted_at = NULL,
    updated_at = NOW()
WHERE existing.deleted_at IS NOT NULL
    AND excluded.deleted_at IS NULL
    AND excluded.timestamp > existing.deleted_at
    AND existing.hash <> excluded.hash
RETURNING (xmax = 0) AS inserted, (deleted_at IS NOT NULL) AS deleted
"#;

const INSERT_VERIFICATION: &str = r#"
WITH covering AS (
    SELECT deleted_at FROM tombstones
    WHERE family = 'verification' AND fid = $1 AND target_key = $2 AND deleted_at >= $4
)
INSERT INTO verifications AS existing
    (fid, target_key, hash, timestamp, signer_address, block_hash, signature, protocol, deleted_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, (SELECT deleted_at FROM covering))
ON CONFLICT (fid, target_key) DO UPDATE SET
    hash = excluded.hash,
    timestamp = excluded.timestamp,
    block_hash = excluded.block_hash,
    signature = excluded.signature,
    protocol = excluded.protocol,
    deleted_at = NULL,
    updated_at = NOW()
WHERE existing.deleted_at IS NOT NULL
    AND excluded.deleted_at IS NULL
    AND excluded.timestamp > existing.deleted_at
    AND existing.hash <> excluded.hash
RETURNING (xmax = 0) AS inserted, (deleted_at IS NOT NULL) AS deleted
"#;

const UPSERT_USER_DATA: &str = r#"
INSERT INTO user_data AS existing (fid, hash, timestamp, type, value)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (fid, type) DO UPDATE SET
    hash = excluded.hash,
    timestamp = excluded.timestamp,
    value = excluded.value,
    updated_at = NOW()
WHERE (excluded.timestamp, excluded.hash) > (existing.timestamp, existing.hash)
RETURNING (xmax = 0) AS inserted
"#;

const LOCAL_RECORDS: &str = r#"
SELECT 'cast' AS family, target_key AS key, hash, 'row' AS kind, deleted_at IS NOT NULL AS deleted FROM casts WHERE fid = $1
UNION ALL
SELECT 'reaction', target_key, hash, 'row', deleted_at IS NOT NULL FROM reactions WHERE fid = $1
UNION ALL
SELECT 'link', target_key, hash, 'row', deleted_at IS NOT NULL FROM links WHERE fid = $1
UNION ALL
SELECT 'verification', target_key, hash, 'row', deleted_at IS NOT NULL FROM verifications WHERE fid = $1
UNION ALL
SELECT 'user_data', type::text, hash, 'row', false FROM user_data WHERE fid = $1
UNION ALL
SELECT family, target_key, hash, 'tombstone', true FROM tombstones WHERE fid = $1
"#;

/// Table holding rows of a family that can be tombstoned.
fn tombstone_table(family: Family) -> Result<&'static str, StoreError> {
    match family {
        Family::Cast => Ok("casts"),
        Family::Reaction => Ok("reactions"),
        Family::Link => Ok("links"),
        Family::Verification => Ok("verifications"),
        Family::UserData => Err(StoreError::NotTombstonable(family)),
    }
}

/// Record the remove, then mark the covered row. `existing` reads the pre-statement snapshot,
/// which tells a missing row apart from one that was already deleted or is newer than the remove.
fn tombstone_query(table: &str) -> String {
    format!(
        r#"
WITH recorded AS (
    INSERT INTO tombstones (family, fid, target_key, hash, deleted_at)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (family, fid, target_key) DO UPDATE SET
        hash = CASE WHEN excluded.deleted_at > tombstones.deleted_at THEN excluded.hash ELSE tombstones.hash END,
        deleted_at = GREATEST(tombstones.deleted_at, excluded.deleted_at)
    RETURNING id
),
existing AS (
    SELECT id FROM {table} WHERE fid = $2 AND target_key = $3
),
marked AS (
    UPDATE {table} SET deleted_at = $5, updated_at = NOW()
    WHERE fid = $2 AND target_key = $3 AND deleted_at IS NULL AND ($6 OR timestamp <= $5)
    RETURNING id
)
SELECT
    EXISTS (SELECT 1 FROM existing) AS found,
    EXISTS (SELECT 1 FROM marked) AS marked,
    (SELECT COUNT(*) FROM recorded) AS recorded
"#
    )
}

/// Block until no other transaction writes `(family, fid, key)`. Released on commit or rollback.
async fn lock_key(
    conn: &mut PgConnection,
    family: Family,
    fid: u64,
    key: &str,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{family}:{fid}:{key}"))
        .execute(&mut *conn)
        .await
        .map_err(|error| query_error("tombstones", "LOCK", error))?;

    Ok(())
}

fn query_error(table: &str, command: &str, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.is_unique_violation() {
            return StoreError::ConstraintViolation {
                table: table.to_owned(),
                constraint: db_error.constraint().unwrap_or_default().to_owned(),
            };
        }
    }

    StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

fn optional_bytes(bytes: &Option<HexBytes>) -> Option<&[u8]> {
    bytes.as_ref().map(HexBytes::as_bytes)
}

/// A `MessageStore` and `CheckpointStore` backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Initialize a new PgStore by lazily connecting a pool to the database in `url`.
    ///
    /// # Arguments
    ///
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: Upper bound of the connection pool.
    /// * `app_name`: Reported to PostgreSQL as the `application_name`.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| StoreError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema migrations. Runs before any message is processed.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn keyed_insert(
        &self,
        family: Family,
        fid: u64,
        target_key: &str,
        query: KeyedInsert<'_>,
    ) -> Result<WriteOutcome, StoreError> {
        let table = tombstone_table(family)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| query_error(table, "BEGIN", error))?;
        lock_key(&mut tx, family, fid, target_key).await?;

        let returned = query
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| query_error(table, "INSERT", error))?;
        tx.commit()
            .await
            .map_err(|error| query_error(table, "COMMIT", error))?;

        Ok(match returned {
            None => WriteOutcome::Unchanged,
            Some((true, deleted)) => WriteOutcome::Inserted { deleted },
            Some((false, _)) => WriteOutcome::Revived,
        })
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn insert_cast(&self, row: &CastRow) -> Result<WriteOutcome, StoreError> {
        let target_key = row.key().encode();
        let query = sqlx::query_as(INSERT_CAST)
            .bind(row.fid as i64)
            .bind(&target_key)
            .bind(row.hash.as_bytes())
            .bind(row.timestamp)
            .bind(row.parent_fid.map(|fid| fid as i64))
            .bind(optional_bytes(&row.parent_hash))
            .bind(row.parent_url.as_deref())
            .bind(&row.text)
            .bind(Json(&row.embeds))
            .bind(Json(&row.mentions))
            .bind(Json(&row.mentions_positions));

        self.keyed_insert(Family::Cast, row.fid, &target_key, query)
            .await
    }

    async fn insert_reaction(&self, row: &ReactionRow) -> Result<WriteOutcome, StoreError> {
        let (target_cast_fid, target_cast_hash, target_url) = match &row.target {
            ReactionTarget::Cast { fid, hash } => (Some(*fid as i64), Some(hash.as_bytes()), None),
            ReactionTarget::Url(url) => (None, None, Some(url.as_str())),
        };

        let target_key = row.key().encode();
        let query = sqlx::query_as(INSERT_REACTION)
            .bind(row.fid as i64)
            .bind(&target_key)
            .bind(row.hash.as_bytes())
            .bind(row.timestamp)
            .bind(row.reaction_type)
            .bind(target_cast_fid)
            .bind(target_cast_hash)
            .bind(target_url);

        self.keyed_insert(Family::Reaction, row.fid, &target_key, query)
            .await
    }

    async fn insert_link(&self, row: &LinkRow) -> Result<WriteOutcome, StoreError> {
        let target_key = row.key().encode();
        let query = sqlx::query_as(INSERT_LINK)
            .bind(row.fid as i64)
            .bind(&target_key)
            .bind(row.hash.as_bytes())
            .bind(row.timestamp)
            .bind(&row.link_type)
            .bind(row.target_fid as i64)
            .bind(row.display_timestamp);

        self.keyed_insert(Family::Link, row.fid, &target_key, query)
            .await
    }

    async fn upsert_user_data(&self, row: &UserDataRow) -> Result<WriteOutcome, StoreError> {
        let returned: Option<(bool,)> = sqlx::query_as(UPSERT_USER_DATA)
            .bind(row.fid as i64)
            .bind(row.hash.as_bytes())
            .bind(row.timestamp)
            .bind(row.user_data_type)
            .bind(&row.value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| query_error("user_data", "INSERT", error))?;

        Ok(match returned {
            None => WriteOutcome::Unchanged,
            Some((true,)) => WriteOutcome::Inserted { deleted: false },
            Some((false,)) => WriteOutcome::Overwritten,
        })
    }

    async fn insert_verification(
        &self,
        row: &VerificationRow,
    ) -> Result<WriteOutcome, StoreError> {
        let target_key = row.key().encode();
        let query = sqlx::query_as(INSERT_VERIFICATION)
            .bind(row.fid as i64)
            .bind(&target_key)
            .bind(row.hash.as_bytes())
            .bind(row.timestamp)
            .bind(row.signer_address.as_bytes())
            .bind(optional_bytes(&row.block_hash))
            .bind(optional_bytes(&row.signature))
            .bind(row.protocol);

        self.keyed_insert(Family::Verification, row.fid, &target_key, query)
            .await
    }

    async fn tombstone(&self, tombstone: &Tombstone) -> Result<WriteOutcome, StoreError> {
        let table = tombstone_table(tombstone.family)?;
        let query = tombstone_query(table);
        let target_key = tombstone.key.encode();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| query_error(table, "BEGIN", error))?;
        lock_key(&mut tx, tombstone.family, tombstone.fid, &target_key).await?;

        let (found, marked, _recorded): (bool, bool, i64) = sqlx::query_as(&query)
            .bind(tombstone.family.as_str())
            .bind(tombstone.fid as i64)
            .bind(&target_key)
            .bind(tombstone.hash.as_bytes())
            .bind(tombstone.deleted_at)
            .bind(tombstone.key.is_exact())
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| query_error(table, "UPDATE", error))?;
        tx.commit()
            .await
            .map_err(|error| query_error(table, "COMMIT", error))?;

        Ok(match (found, marked) {
            (_, true) => WriteOutcome::Tombstoned,
            (false, false) => WriteOutcome::TombstonePending,
            (true, false) => WriteOutcome::Unchanged,
        })
    }

    async fn local_records(&self, fid: u64) -> Result<Vec<LocalRecord>, StoreError> {
        let rows: Vec<(String, String, Vec<u8>, String, bool)> = sqlx::query_as(LOCAL_RECORDS)
            .bind(fid as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| query_error("tombstones", "SELECT", error))?;

        rows.into_iter()
            .map(|(family, key, hash, kind, deleted)| {
                let family = Family::from_str(&family)
                    .map_err(|invalid| StoreError::UnknownFamily(invalid.0))?;
                let kind = if kind == "tombstone" {
                    RecordKind::Tombstone
                } else {
                    RecordKind::Row
                };

                Ok(LocalRecord {
                    family,
                    key,
                    hash: HexBytes(hash),
                    kind,
                    deleted,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load_checkpoint(&self, shard: &ShardKey) -> Result<Option<u64>, StoreError> {
        let position: Option<(i64,)> =
            sqlx::query_as("SELECT position FROM shard_checkpoints WHERE shard = $1")
                .bind(shard.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| query_error("shard_checkpoints", "SELECT", error))?;

        Ok(position.map(|(position,)| position as u64))
    }

    async fn save_checkpoint(&self, shard: &ShardKey, position: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO shard_checkpoints (shard, position, updated_at)
VALUES ($1, $2, NOW())
ON CONFLICT (shard) DO UPDATE SET
    position = GREATEST(shard_checkpoints.position, excluded.position),
    updated_at = NOW()
            "#,
        )
        .bind(shard.to_string())
        .bind(position as i64)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("shard_checkpoints", "INSERT", error))?;

        Ok(())
    }
}
