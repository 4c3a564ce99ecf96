//! Replication status queries against PostgreSQL-compatible servers

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;

use super::{parse_lsn, replication_lag, ReplicationSource, ReplicationStatus, SlotStats};
use crate::error::{Error, Result};
use crate::registry::{Node, NodeId};

const STATUS_QUERY: &str = r#"
SELECT pg_catalog.pg_is_in_recovery() AS in_recovery,
       COALESCE(pg_catalog.pg_last_wal_receive_lsn(), '0/0'::pg_lsn)::text AS last_wal_receive_lsn,
       COALESCE(pg_catalog.pg_last_wal_replay_lsn(), '0/0'::pg_lsn)::text AS last_wal_replay_lsn,
       pg_catalog.pg_last_xact_replay_timestamp() AS last_xact_replay_timestamp,
       pg_catalog.clock_timestamp() AS now,
       CASE WHEN pg_catalog.pg_is_in_recovery() IS FALSE
         THEN FALSE
         ELSE pg_catalog.pg_is_wal_replay_paused()
       END AS wal_replay_paused
"#;

const SLOT_QUERY: &str = r#"
SELECT pg_catalog.current_setting('max_wal_senders')::INT8 AS max_wal_senders,
       (SELECT pg_catalog.count(*) FROM pg_catalog.pg_stat_replication) AS attached_wal_receivers,
       pg_catalog.current_setting('max_replication_slots')::INT8 AS max_replication_slots,
       (SELECT pg_catalog.count(*) FROM pg_catalog.pg_replication_slots
         WHERE slot_type = 'physical') AS total_replication_slots,
       (SELECT pg_catalog.count(*) FROM pg_catalog.pg_replication_slots
         WHERE active IS TRUE AND slot_type = 'physical') AS active_replication_slots,
       (SELECT pg_catalog.count(*) FROM pg_catalog.pg_replication_slots
         WHERE active IS FALSE AND slot_type = 'physical') AS inactive_replication_slots
"#;

/// Queries each node through a small lazily connected pool
pub struct PgReplicationSource {
    pools: RwLock<HashMap<NodeId, PgPool>>,
    connect_timeout: Duration,
}

impl PgReplicationSource {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    async fn pool(&self, node: &Node) -> Result<PgPool> {
        if let Some(pool) = self.pools.read().await.get(&node.id) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect_lazy(&node.conninfo)?;

        self.pools.write().await.insert(node.id, pool.clone());
        Ok(pool)
    }

    /// Drop the cached pool so the next call reconnects
    async fn forget(&self, node_id: NodeId) {
        if let Some(pool) = self.pools.write().await.remove(&node_id) {
            pool.close().await;
        }
    }
}

fn lsn_column(row: &sqlx::postgres::PgRow, column: &str) -> Result<u64> {
    let text: String = row.try_get(column)?;
    parse_lsn(&text).ok_or_else(|| Error::Internal(format!("unparseable LSN '{}' in {}", text, column)))
}

#[async_trait::async_trait]
impl ReplicationSource for PgReplicationSource {
    async fn ping(&self, node: &Node) -> Result<()> {
        let pool = self.pool(node).await?;
        if let Err(e) = sqlx::query("SELECT 1").execute(&pool).await {
            tracing::debug!("ping of node {} failed: {}", node.id, e);
            self.forget(node.id).await;
            return Err(Error::ConnectionFailed {
                address: node.name.clone(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    async fn replication_status(&self, node: &Node) -> Result<ReplicationStatus> {
        let pool = self.pool(node).await?;
        let row = sqlx::query(STATUS_QUERY).fetch_one(&pool).await?;

        let receive = lsn_column(&row, "last_wal_receive_lsn")?;
        let replay = lsn_column(&row, "last_wal_replay_lsn")?;
        let last_replay: Option<DateTime<Utc>> = row.try_get("last_xact_replay_timestamp")?;
        let now: DateTime<Utc> = row.try_get("now")?;

        Ok(ReplicationStatus {
            in_recovery: row.try_get("in_recovery")?,
            last_wal_receive_lsn: receive,
            last_wal_replay_lsn: replay,
            replication_lag_time: replication_lag(receive, replay, last_replay, now),
            wal_replay_paused: row.try_get("wal_replay_paused")?,
            receiving_streamed_wal: receive >= replay,
            ..ReplicationStatus::default()
        })
    }

    async fn is_in_recovery(&self, node: &Node) -> Result<bool> {
        let pool = self.pool(node).await?;
        match sqlx::query_scalar::<_, bool>("SELECT pg_catalog.pg_is_in_recovery()")
            .fetch_one(&pool)
            .await
        {
            Ok(in_recovery) => Ok(in_recovery),
            Err(e) => {
                self.forget(node.id).await;
                Err(e.into())
            }
        }
    }

    async fn attached_children(&self, node: &Node) -> Result<Vec<String>> {
        let pool = self.pool(node).await?;
        let rows = sqlx::query(
            "SELECT application_name FROM pg_catalog.pg_stat_replication \
             WHERE state IN ('streaming', 'catchup') ORDER BY application_name",
        )
        .fetch_all(&pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("application_name").map_err(Error::from))
            .collect()
    }

    async fn slot_stats(&self, node: &Node) -> Result<SlotStats> {
        let pool = self.pool(node).await?;
        let row = sqlx::query(SLOT_QUERY).fetch_one(&pool).await?;

        Ok(SlotStats {
            max_wal_senders: row.try_get("max_wal_senders")?,
            attached_wal_receivers: row.try_get("attached_wal_receivers")?,
            max_replication_slots: row.try_get("max_replication_slots")?,
            total_replication_slots: row.try_get("total_replication_slots")?,
            active_replication_slots: row.try_get("active_replication_slots")?,
            inactive_replication_slots: row.try_get("inactive_replication_slots")?,
        })
    }
}
