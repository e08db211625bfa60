// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite backend for the row-shaped durable stores.
//!
//! Covers shard leases, namespace metadata, cluster metadata/membership,
//! and the durable queue streams. Execution and history state go through
//! the in-memory reference implementation; SQL adapters for those are a
//! separate backend concern.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::codec::{DataBlob, EncodingKind};
use crate::error::{CoreError, Result};

use super::{
    ClusterMember, ClusterMetadataRecord, ClusterMetadataStore, MetadataStore, NamespaceRecord,
    Queue, QueueAckLevels, QueueMessage, ShardRecord, ShardStore, UpdateShardRequest,
    EMPTY_QUEUE_MESSAGE_ID,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const QUEUE_TYPE_NORMAL: i64 = 0;
const QUEUE_TYPE_DLQ: i64 = 1;

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::Canceled);
    }
    Ok(())
}

fn parse_encoding(raw: &str) -> Result<EncodingKind> {
    EncodingKind::from_str(raw).map_err(|_| CoreError::Serialization {
        context: "stored blob".to_string(),
        details: format!("unknown encoding '{raw}'"),
    })
}

#[derive(sqlx::FromRow)]
struct ShardRow {
    shard_id: i32,
    range_id: i64,
    owner: String,
    encoding: String,
    info: Vec<u8>,
}

impl ShardRow {
    fn into_record(self) -> Result<ShardRecord> {
        Ok(ShardRecord {
            shard_id: self.shard_id,
            range_id: self.range_id,
            owner: self.owner,
            info: DataBlob {
                encoding: parse_encoding(&self.encoding)?,
                data: self.info,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct NamespaceRow {
    id: String,
    name: String,
    encoding: String,
    info: Vec<u8>,
    is_global: bool,
    notification_version: i64,
}

impl NamespaceRow {
    fn into_record(self) -> Result<NamespaceRecord> {
        Ok(NamespaceRecord {
            id: self.id,
            name: self.name,
            info: DataBlob {
                encoding: parse_encoding(&self.encoding)?,
                data: self.info,
            },
            is_global: self.is_global,
            notification_version: self.notification_version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClusterMetadataRow {
    cluster_name: String,
    encoding: String,
    metadata: Vec<u8>,
    version: i64,
}

impl ClusterMetadataRow {
    fn into_record(self) -> Result<ClusterMetadataRecord> {
        Ok(ClusterMetadataRecord {
            cluster_name: self.cluster_name,
            metadata: DataBlob {
                encoding: parse_encoding(&self.encoding)?,
                data: self.metadata,
            },
            version: self.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClusterMemberRow {
    host_id: String,
    rpc_address: String,
    role: String,
    session_started_at: DateTime<Utc>,
    record_expiry: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct QueueMessageRow {
    message_id: i64,
    encoding: String,
    payload: Vec<u8>,
}

impl QueueMessageRow {
    fn into_message(self) -> Result<QueueMessage> {
        Ok(QueueMessage {
            id: self.message_id,
            blob: DataBlob {
                encoding: parse_encoding(&self.encoding)?,
                data: self.payload,
            },
        })
    }
}

/// SQLite-backed row stores.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. The caller runs migrations.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store backed by a database file, creating
    /// parent directories and running migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::Unavailable {
                    message: format!("failed to create directory {:?}: {}", parent, e),
                })?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Unavailable {
                message: format!("failed to connect to SQLite at {:?}: {}", path, e),
            })?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Create an in-memory store for tests and embedded use.
    ///
    /// A single connection: every pooled connection of `sqlite::memory:`
    /// would otherwise get its own private database.
    pub async fn memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::Unavailable {
                message: format!("failed to open in-memory SQLite: {}", e),
            })?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        MIGRATOR.run(pool).await.map_err(|e| CoreError::Unavailable {
            message: format!("failed to run migrations: {}", e),
        })
    }

    async fn enqueue(&self, queue_type: i64, blob: DataBlob) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let next_id: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(message_id) + 1, 0)
            FROM queue_messages
            WHERE queue_type = ?
            "#,
        )
        .bind(queue_type)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO queue_messages (queue_type, message_id, encoding, payload)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(queue_type)
        .bind(next_id)
        .bind(blob.encoding.to_string())
        .bind(&blob.data)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next_id)
    }

    async fn get_queue_ack_levels(&self, queue_type: i64) -> Result<QueueAckLevels> {
        let row: Option<(String, Vec<u8>, i64)> = sqlx::query_as(
            r#"
            SELECT encoding, ack_levels, version
            FROM queue_metadata
            WHERE queue_type = ?
            "#,
        )
        .bind(queue_type)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((encoding, data, version)) => {
                let blob = DataBlob {
                    encoding: parse_encoding(&encoding)?,
                    data,
                };
                let mut ack_levels: QueueAckLevels = blob.decode()?;
                ack_levels.version = version;
                Ok(ack_levels)
            }
            None => Ok(QueueAckLevels::default()),
        }
    }

    async fn set_queue_ack_levels(&self, queue_type: i64, ack_levels: QueueAckLevels) -> Result<()> {
        let stored = self.get_queue_ack_levels(queue_type).await?;
        if ack_levels.version != stored.version {
            return Err(CoreError::ConditionFailed {
                expected: ack_levels.version,
                actual: stored.version,
            });
        }

        let blob = DataBlob::encode(&QueueAckLevels {
            ack_levels: ack_levels.ack_levels.clone(),
            version: 0,
        })?;
        sqlx::query(
            r#"
            INSERT INTO queue_metadata (queue_type, encoding, ack_levels, version)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (queue_type) DO UPDATE
            SET encoding = ?2, ack_levels = ?3, version = ?4
            "#,
        )
        .bind(queue_type)
        .bind(blob.encoding.to_string())
        .bind(&blob.data)
        .bind(ack_levels.version + 1)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// ShardStore
// ============================================================================

#[async_trait]
impl ShardStore for SqliteStore {
    async fn get_shard(&self, cancel: &CancellationToken, shard_id: i32) -> Result<ShardRecord> {
        check_cancel(cancel)?;
        let row: Option<ShardRow> = sqlx::query_as(
            r#"
            SELECT shard_id, range_id, owner, encoding, info
            FROM shards
            WHERE shard_id = ?
            "#,
        )
        .bind(shard_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ShardRow::into_record)
            .transpose()?
            .ok_or(CoreError::ShardNotFound { shard_id })
    }

    async fn create_shard(&self, cancel: &CancellationToken, record: ShardRecord) -> Result<()> {
        check_cancel(cancel)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO shards (shard_id, range_id, owner, encoding, info)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.shard_id)
        .bind(record.range_id)
        .bind(&record.owner)
        .bind(record.info.encoding.to_string())
        .bind(&record.info.data)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::internal(format!(
                "shard {} already exists",
                record.shard_id
            )));
        }
        Ok(())
    }

    async fn update_shard(
        &self,
        cancel: &CancellationToken,
        request: UpdateShardRequest,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let result = sqlx::query(
            r#"
            UPDATE shards
            SET range_id = ?, owner = ?, encoding = ?, info = ?
            WHERE shard_id = ? AND range_id = ?
            "#,
        )
        .bind(request.range_id)
        .bind(&request.owner)
        .bind(request.info.encoding.to_string())
        .bind(&request.info.data)
        .bind(request.shard_id)
        .bind(request.previous_range_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a stolen lease from a missing shard.
            let current: Option<i64> =
                sqlx::query_scalar("SELECT range_id FROM shards WHERE shard_id = ?")
                    .bind(request.shard_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match current {
                Some(range_id) => Err(CoreError::ShardOwnershipLost {
                    shard_id: request.shard_id,
                    request_range_id: request.previous_range_id,
                    current_range_id: Some(range_id),
                }),
                None => Err(CoreError::ShardNotFound {
                    shard_id: request.shard_id,
                }),
            };
        }
        Ok(())
    }

    async fn assert_shard_ownership(
        &self,
        cancel: &CancellationToken,
        shard_id: i32,
        range_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let current: Option<i64> =
            sqlx::query_scalar("SELECT range_id FROM shards WHERE shard_id = ?")
                .bind(shard_id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            Some(current) if current == range_id => Ok(()),
            Some(current) => Err(CoreError::ShardOwnershipLost {
                shard_id,
                request_range_id: range_id,
                current_range_id: Some(current),
            }),
            None => Err(CoreError::ShardNotFound { shard_id }),
        }
    }
}

// ============================================================================
// MetadataStore
// ============================================================================

async fn bump_notification_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> Result<i64> {
    sqlx::query("UPDATE namespace_metadata SET notification_version = notification_version + 1 WHERE id = 1")
        .execute(&mut **tx)
        .await?;
    let version: i64 =
        sqlx::query_scalar("SELECT notification_version FROM namespace_metadata WHERE id = 1")
            .fetch_one(&mut **tx)
            .await?;
    Ok(version)
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn create_namespace(
        &self,
        cancel: &CancellationToken,
        record: NamespaceRecord,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut tx = self.pool.begin().await?;
        let version = bump_notification_version(&mut tx).await?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO namespaces (id, name, encoding, info, is_global, notification_version)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.info.encoding.to_string())
        .bind(&record.info.data)
        .bind(record.is_global)
        .bind(version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::CurrentWorkflowConditionFailed {
                message: format!("namespace '{}' already exists", record.name),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_namespace(
        &self,
        cancel: &CancellationToken,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Result<NamespaceRecord> {
        check_cancel(cancel)?;
        let row: Option<NamespaceRow> = match (id, name) {
            (Some(id), _) => {
                sqlx::query_as(
                    "SELECT id, name, encoding, info, is_global, notification_version FROM namespaces WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            (None, Some(name)) => {
                sqlx::query_as(
                    "SELECT id, name, encoding, info, is_global, notification_version FROM namespaces WHERE name = ?",
                )
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
            (None, None) => {
                return Err(CoreError::internal("get_namespace requires an id or a name"))
            }
        };
        row.map(NamespaceRow::into_record)
            .transpose()?
            .ok_or_else(|| CoreError::NamespaceNotFound {
                namespace: id.or(name).unwrap_or_default().to_string(),
            })
    }

    async fn update_namespace(
        &self,
        cancel: &CancellationToken,
        record: NamespaceRecord,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut tx = self.pool.begin().await?;
        let version = bump_notification_version(&mut tx).await?;
        let result = sqlx::query(
            r#"
            UPDATE namespaces
            SET name = ?, encoding = ?, info = ?, is_global = ?, notification_version = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.name)
        .bind(record.info.encoding.to_string())
        .bind(&record.info.data)
        .bind(record.is_global)
        .bind(version)
        .bind(&record.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NamespaceNotFound {
                namespace: record.id,
            });
        }
        tx.commit().await?;
        Ok(())
    }

    async fn rename_namespace(
        &self,
        cancel: &CancellationToken,
        previous_name: &str,
        new_name: &str,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let mut tx = self.pool.begin().await?;
        let version = bump_notification_version(&mut tx).await?;
        let result = sqlx::query(
            "UPDATE namespaces SET name = ?, notification_version = ? WHERE name = ?",
        )
        .bind(new_name)
        .bind(version)
        .bind(previous_name)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NamespaceNotFound {
                namespace: previous_name.to_string(),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_namespace(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        check_cancel(cancel)?;
        sqlx::query("DELETE FROM namespaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_namespaces(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<NamespaceRecord>, Vec<u8>)> {
        check_cancel(cancel)?;
        let after: String = if page_token.is_empty() {
            String::new()
        } else {
            crate::codec::decode_page_token(&page_token)?
        };

        let rows: Vec<NamespaceRow> = sqlx::query_as(
            r#"
            SELECT id, name, encoding, info, is_global, notification_version
            FROM namespaces
            WHERE name > ?
            ORDER BY name
            LIMIT ?
            "#,
        )
        .bind(&after)
        .bind(page_size.max(1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<NamespaceRecord> = rows
            .into_iter()
            .map(NamespaceRow::into_record)
            .collect::<Result<_>>()?;
        let next = if records.len() == page_size.max(1) {
            crate::codec::encode_page_token(&records.last().map(|r| r.name.clone()))?
        } else {
            Vec::new()
        };
        Ok((records, next))
    }

    async fn get_metadata(&self, cancel: &CancellationToken) -> Result<i64> {
        check_cancel(cancel)?;
        let version: i64 =
            sqlx::query_scalar("SELECT notification_version FROM namespace_metadata WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(version)
    }
}

// ============================================================================
// ClusterMetadataStore
// ============================================================================

#[async_trait]
impl ClusterMetadataStore for SqliteStore {
    async fn list_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<ClusterMetadataRecord>, Vec<u8>)> {
        check_cancel(cancel)?;
        let after: String = if page_token.is_empty() {
            String::new()
        } else {
            crate::codec::decode_page_token(&page_token)?
        };

        let rows: Vec<ClusterMetadataRow> = sqlx::query_as(
            r#"
            SELECT cluster_name, encoding, metadata, version
            FROM cluster_metadata
            WHERE cluster_name > ?
            ORDER BY cluster_name
            LIMIT ?
            "#,
        )
        .bind(&after)
        .bind(page_size.max(1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<ClusterMetadataRecord> = rows
            .into_iter()
            .map(ClusterMetadataRow::into_record)
            .collect::<Result<_>>()?;
        let next = if records.len() == page_size.max(1) {
            crate::codec::encode_page_token(&records.last().map(|r| r.cluster_name.clone()))?
        } else {
            Vec::new()
        };
        Ok((records, next))
    }

    async fn get_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        cluster_name: &str,
    ) -> Result<ClusterMetadataRecord> {
        check_cancel(cancel)?;
        let row: Option<ClusterMetadataRow> = sqlx::query_as(
            "SELECT cluster_name, encoding, metadata, version FROM cluster_metadata WHERE cluster_name = ?",
        )
        .bind(cluster_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ClusterMetadataRow::into_record)
            .transpose()?
            .ok_or_else(|| CoreError::NamespaceNotFound {
                namespace: cluster_name.to_string(),
            })
    }

    async fn save_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        record: ClusterMetadataRecord,
    ) -> Result<bool> {
        check_cancel(cancel)?;
        let mut tx = self.pool.begin().await?;
        let stored: Option<i64> =
            sqlx::query_scalar("SELECT version FROM cluster_metadata WHERE cluster_name = ?")
                .bind(&record.cluster_name)
                .fetch_optional(&mut *tx)
                .await?;
        if record.version != stored.unwrap_or(0) {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO cluster_metadata (cluster_name, encoding, metadata, version)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (cluster_name) DO UPDATE
            SET encoding = ?2, metadata = ?3, version = ?4
            "#,
        )
        .bind(&record.cluster_name)
        .bind(record.metadata.encoding.to_string())
        .bind(&record.metadata.data)
        .bind(record.version + 1)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_cluster_metadata(
        &self,
        cancel: &CancellationToken,
        cluster_name: &str,
    ) -> Result<()> {
        check_cancel(cancel)?;
        sqlx::query("DELETE FROM cluster_metadata WHERE cluster_name = ?")
            .bind(cluster_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_cluster_members(&self, cancel: &CancellationToken) -> Result<Vec<ClusterMember>> {
        check_cancel(cancel)?;
        let rows: Vec<ClusterMemberRow> = sqlx::query_as(
            r#"
            SELECT host_id, rpc_address, role, session_started_at, record_expiry
            FROM cluster_members
            WHERE record_expiry > ?
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ClusterMember {
                host_id: row.host_id,
                rpc_address: row.rpc_address,
                role: row.role,
                session_started_at: row.session_started_at,
                record_expiry: row.record_expiry,
            })
            .collect())
    }

    async fn upsert_cluster_membership(
        &self,
        cancel: &CancellationToken,
        member: ClusterMember,
    ) -> Result<()> {
        check_cancel(cancel)?;
        sqlx::query(
            r#"
            INSERT INTO cluster_members (host_id, rpc_address, role, session_started_at, record_expiry)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (host_id) DO UPDATE
            SET rpc_address = ?2, role = ?3, session_started_at = ?4, record_expiry = ?5
            "#,
        )
        .bind(&member.host_id)
        .bind(&member.rpc_address)
        .bind(&member.role)
        .bind(member.session_started_at)
        .bind(member.record_expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_cluster_membership(&self, cancel: &CancellationToken) -> Result<usize> {
        check_cancel(cancel)?;
        let result = sqlx::query("DELETE FROM cluster_members WHERE record_expiry <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

// ============================================================================
// Queue
// ============================================================================

#[async_trait]
impl Queue for SqliteStore {
    async fn enqueue_message(&self, cancel: &CancellationToken, blob: DataBlob) -> Result<i64> {
        check_cancel(cancel)?;
        self.enqueue(QUEUE_TYPE_NORMAL, blob).await
    }

    async fn read_messages(
        &self,
        cancel: &CancellationToken,
        last_message_id: i64,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>> {
        check_cancel(cancel)?;
        let floor = if last_message_id == EMPTY_QUEUE_MESSAGE_ID {
            -1
        } else {
            last_message_id
        };
        let rows: Vec<QueueMessageRow> = sqlx::query_as(
            r#"
            SELECT message_id, encoding, payload
            FROM queue_messages
            WHERE queue_type = ? AND message_id > ?
            ORDER BY message_id
            LIMIT ?
            "#,
        )
        .bind(QUEUE_TYPE_NORMAL)
        .bind(floor)
        .bind(max_count as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueueMessageRow::into_message).collect()
    }

    async fn delete_messages_before(
        &self,
        cancel: &CancellationToken,
        exclusive_max_message_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        sqlx::query("DELETE FROM queue_messages WHERE queue_type = ? AND message_id < ?")
            .bind(QUEUE_TYPE_NORMAL)
            .bind(exclusive_max_message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_ack_levels(
        &self,
        cancel: &CancellationToken,
        ack_levels: QueueAckLevels,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.set_queue_ack_levels(QUEUE_TYPE_NORMAL, ack_levels).await
    }

    async fn get_ack_levels(&self, cancel: &CancellationToken) -> Result<QueueAckLevels> {
        check_cancel(cancel)?;
        self.get_queue_ack_levels(QUEUE_TYPE_NORMAL).await
    }

    async fn enqueue_message_to_dlq(
        &self,
        cancel: &CancellationToken,
        blob: DataBlob,
    ) -> Result<i64> {
        check_cancel(cancel)?;
        self.enqueue(QUEUE_TYPE_DLQ, blob).await
    }

    async fn read_messages_from_dlq(
        &self,
        cancel: &CancellationToken,
        inclusive_min_message_id: i64,
        exclusive_max_message_id: i64,
        page_size: usize,
        page_token: Vec<u8>,
    ) -> Result<(Vec<QueueMessage>, Vec<u8>)> {
        check_cancel(cancel)?;
        let after: Option<i64> = if page_token.is_empty() {
            None
        } else {
            Some(crate::codec::decode_page_token(&page_token)?)
        };
        let floor = after
            .map(|a| a + 1)
            .unwrap_or(inclusive_min_message_id);

        let rows: Vec<QueueMessageRow> = sqlx::query_as(
            r#"
            SELECT message_id, encoding, payload
            FROM queue_messages
            WHERE queue_type = ? AND message_id >= ? AND message_id < ?
            ORDER BY message_id
            LIMIT ?
            "#,
        )
        .bind(QUEUE_TYPE_DLQ)
        .bind(floor)
        .bind(exclusive_max_message_id)
        .bind(page_size.max(1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let messages: Vec<QueueMessage> = rows
            .into_iter()
            .map(QueueMessageRow::into_message)
            .collect::<Result<_>>()?;
        let next = if messages.len() == page_size.max(1) {
            crate::codec::encode_page_token(&messages.last().map(|m| m.id))?
        } else {
            Vec::new()
        };
        Ok((messages, next))
    }

    async fn delete_message_from_dlq(
        &self,
        cancel: &CancellationToken,
        message_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        sqlx::query("DELETE FROM queue_messages WHERE queue_type = ? AND message_id = ?")
            .bind(QUEUE_TYPE_DLQ)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn range_delete_messages_from_dlq(
        &self,
        cancel: &CancellationToken,
        inclusive_min_message_id: i64,
        exclusive_max_message_id: i64,
    ) -> Result<()> {
        check_cancel(cancel)?;
        sqlx::query(
            "DELETE FROM queue_messages WHERE queue_type = ? AND message_id >= ? AND message_id < ?",
        )
        .bind(QUEUE_TYPE_DLQ)
        .bind(inclusive_min_message_id)
        .bind(exclusive_max_message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_dlq_ack_levels(
        &self,
        cancel: &CancellationToken,
        ack_levels: QueueAckLevels,
    ) -> Result<()> {
        check_cancel(cancel)?;
        self.set_queue_ack_levels(QUEUE_TYPE_DLQ, ack_levels).await
    }

    async fn get_dlq_ack_levels(&self, cancel: &CancellationToken) -> Result<QueueAckLevels> {
        check_cancel(cancel)?;
        self.get_queue_ack_levels(QUEUE_TYPE_DLQ).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn blob(text: &str) -> DataBlob {
        DataBlob::encode(&text).expect("encode")
    }

    #[tokio::test]
    async fn test_shard_lease_round_trip() {
        let store = SqliteStore::memory().await.expect("store");

        let err = store.get_shard(&cancel(), 1).await.unwrap_err();
        assert_eq!(err.error_code(), "SHARD_NOT_FOUND");

        store
            .create_shard(
                &cancel(),
                ShardRecord {
                    shard_id: 1,
                    range_id: 0,
                    owner: "host-a".to_string(),
                    info: blob("{}"),
                },
            )
            .await
            .expect("create");

        store
            .update_shard(
                &cancel(),
                UpdateShardRequest {
                    shard_id: 1,
                    range_id: 1,
                    owner: "host-a".to_string(),
                    info: blob("{}"),
                    previous_range_id: 0,
                },
            )
            .await
            .expect("renew");

        let err = store
            .update_shard(
                &cancel(),
                UpdateShardRequest {
                    shard_id: 1,
                    range_id: 2,
                    owner: "host-b".to_string(),
                    info: blob("{}"),
                    previous_range_id: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SHARD_OWNERSHIP_LOST");

        store
            .assert_shard_ownership(&cancel(), 1, 1)
            .await
            .expect("still owned at range 1");
    }

    #[tokio::test]
    async fn test_queue_first_message_id_is_zero() {
        let store = SqliteStore::memory().await.expect("store");
        let id = store.enqueue_message(&cancel(), blob("m0")).await.unwrap();
        assert_eq!(id, 0);
        let id = store.enqueue_message(&cancel(), blob("m1")).await.unwrap();
        assert_eq!(id, 1);

        let messages = store
            .read_messages(&cancel(), EMPTY_QUEUE_MESSAGE_ID, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, 0);

        let empty = store
            .read_messages(&cancel(), super::super::MAX_QUEUE_MESSAGE_ID, 10)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_ack_levels_version_conditional() {
        let store = SqliteStore::memory().await.expect("store");
        let mut levels = store.get_ack_levels(&cancel()).await.unwrap();
        assert_eq!(levels.version, 0);

        levels.ack_levels.insert("reader-1".to_string(), 7);
        store
            .update_ack_levels(&cancel(), levels.clone())
            .await
            .expect("first update");

        // Re-using the stale version must fail.
        let err = store.update_ack_levels(&cancel(), levels).await.unwrap_err();
        assert_eq!(err.error_code(), "CONDITION_FAILED");

        let current = store.get_ack_levels(&cancel()).await.unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.ack_levels.get("reader-1"), Some(&7));
    }

    #[tokio::test]
    async fn test_cluster_membership_expiry_and_pruning() {
        let store = SqliteStore::memory().await.expect("store");
        let now = Utc::now();

        store
            .upsert_cluster_membership(
                &cancel(),
                ClusterMember {
                    host_id: "host-live".to_string(),
                    rpc_address: "10.0.0.1:7233".to_string(),
                    role: "history".to_string(),
                    session_started_at: now,
                    record_expiry: now + chrono::Duration::minutes(5),
                },
            )
            .await
            .expect("upsert live");
        store
            .upsert_cluster_membership(
                &cancel(),
                ClusterMember {
                    host_id: "host-stale".to_string(),
                    rpc_address: "10.0.0.2:7233".to_string(),
                    role: "matching".to_string(),
                    session_started_at: now - chrono::Duration::hours(2),
                    record_expiry: now - chrono::Duration::minutes(1),
                },
            )
            .await
            .expect("upsert stale");

        let members = store.get_cluster_members(&cancel()).await.expect("list");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].host_id, "host-live");

        let pruned = store.prune_cluster_membership(&cancel()).await.expect("prune");
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_cluster_metadata_save_is_version_conditional() {
        let store = SqliteStore::memory().await.expect("store");
        let record = ClusterMetadataRecord {
            cluster_name: "primary".to_string(),
            metadata: blob("{}"),
            version: 0,
        };
        assert!(store
            .save_cluster_metadata(&cancel(), record.clone())
            .await
            .expect("first save"));
        // Stale version does not apply.
        assert!(!store
            .save_cluster_metadata(&cancel(), record)
            .await
            .expect("stale save"));
        let stored = store
            .get_cluster_metadata(&cancel(), "primary")
            .await
            .expect("get");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_from_path_creates_database_and_migrates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data").join("weft.db");
        let store = SqliteStore::from_path(&path).await.expect("open");
        assert!(path.exists());

        store
            .create_shard(
                &cancel(),
                ShardRecord {
                    shard_id: 9,
                    range_id: 0,
                    owner: "host-file".to_string(),
                    info: blob("{}"),
                },
            )
            .await
            .expect("create shard on disk");
        let shard = store.get_shard(&cancel(), 9).await.expect("read back");
        assert_eq!(shard.owner, "host-file");
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let store = SqliteStore::memory().await.expect("store");
        store
            .create_namespace(
                &cancel(),
                NamespaceRecord {
                    id: "ns-1".to_string(),
                    name: "default".to_string(),
                    info: blob("{}"),
                    is_global: false,
                    notification_version: 0,
                },
            )
            .await
            .expect("create");

        let v1 = store.get_metadata(&cancel()).await.unwrap();
        assert!(v1 > 0);

        store
            .rename_namespace(&cancel(), "default", "primary")
            .await
            .expect("rename");
        let ns = store
            .get_namespace(&cancel(), None, Some("primary"))
            .await
            .expect("get renamed");
        assert_eq!(ns.id, "ns-1");

        let (list, token) = store.list_namespaces(&cancel(), 10, Vec::new()).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(token.is_empty());
    }
}
