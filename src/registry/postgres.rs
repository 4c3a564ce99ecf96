//! PostgreSQL-backed node registry
//!
//! Node records live in `repguard.nodes` and are replicated to every
//! standby along with the rest of the database. Reads go to the local
//! node; writes go to the current primary, except `promote_node` which is
//! issued by a freshly promoted node against itself.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::RwLock;

use super::{check_upstream, Node, NodeId, NodeRegistry, NodeType};
use crate::error::{Error, Result};
use crate::events::EventRecord;

/// Schema installed by `repguard start --install-schema`
pub const SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS repguard;

CREATE TABLE IF NOT EXISTS repguard.nodes (
    node_id          INTEGER PRIMARY KEY,
    upstream_node_id INTEGER NULL REFERENCES repguard.nodes (node_id) DEFERRABLE,
    type             TEXT    NOT NULL CHECK (type IN ('primary', 'standby', 'witness')),
    node_name        TEXT    NOT NULL UNIQUE,
    conninfo         TEXT    NOT NULL,
    control_address  TEXT    NOT NULL,
    repluser         TEXT    NOT NULL,
    slot_name        TEXT    NULL,
    location         TEXT    NOT NULL DEFAULT 'default',
    priority         INTEGER NOT NULL DEFAULT 100 CHECK (priority >= 0),
    active           BOOLEAN NOT NULL DEFAULT TRUE,
    CONSTRAINT nodes_upstream_not_self CHECK (upstream_node_id IS DISTINCT FROM node_id)
);

CREATE TABLE IF NOT EXISTS repguard.events (
    node_id          INTEGER     NOT NULL,
    event            TEXT        NOT NULL,
    successful       BOOLEAN     NOT NULL DEFAULT TRUE,
    event_timestamp  TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    details          TEXT        NULL
);
"#;

const NODE_COLUMNS: &str = "node_id, upstream_node_id, type, node_name, conninfo, control_address, \
                            repluser, slot_name, location, priority, active";

/// Registry stored in the replicated `repguard` schema
pub struct PgRegistry {
    /// Pool against the local node (reads, promotion)
    local: PgPool,
    /// Pools against primary candidates, keyed by node id
    primaries: RwLock<HashMap<NodeId, PgPool>>,
    connect_timeout: Duration,
}

impl PgRegistry {
    /// Connect to the local node's copy of the registry
    pub async fn connect(conninfo: &str, pool_size: u32, connect_timeout: Duration) -> Result<Self> {
        let local = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(connect_timeout)
            .connect(conninfo)
            .await?;

        Ok(Self {
            local,
            primaries: RwLock::new(HashMap::new()),
            connect_timeout,
        })
    }

    /// Create the registry schema if it does not exist
    pub async fn install_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.local).await?;
        }
        tracing::info!("Registry schema installed");
        Ok(())
    }

    /// Pool against the node currently running as primary.
    ///
    /// The local copy of the records may predate a promotion, so each
    /// candidate is asked whether it is in recovery. The registered
    /// primary is tried first.
    async fn primary_pool(&self) -> Result<PgPool> {
        let mut candidates: Vec<Node> = self
            .get_all_nodes()
            .await?
            .into_iter()
            .filter(|n| n.active && !n.is_witness())
            .collect();
        candidates.sort_by_key(|n| n.node_type != NodeType::Primary);

        for node in &candidates {
            let pool = match self.pool_for(node).await {
                Ok(pool) => pool,
                Err(e) => {
                    tracing::debug!("node {} unavailable for registry writes: {}", node.id, e);
                    continue;
                }
            };
            let in_recovery = sqlx::query_scalar::<_, bool>("SELECT pg_catalog.pg_is_in_recovery()")
                .fetch_one(&pool)
                .await;
            match in_recovery {
                Ok(false) => {
                    // Only the running primary keeps a pool
                    self.primaries.write().await.retain(|id, _| *id == node.id);
                    return Ok(pool);
                }
                Ok(true) => {}
                Err(e) => {
                    tracing::debug!("node {} did not answer recovery check: {}", node.id, e);
                    self.primaries.write().await.remove(&node.id);
                }
            }
        }
        Err(Error::NoPrimary)
    }

    async fn pool_for(&self, node: &Node) -> Result<PgPool> {
        if let Some(pool) = self.primaries.read().await.get(&node.id) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(self.connect_timeout)
            .connect(&node.conninfo)
            .await?;
        self.primaries.write().await.insert(node.id, pool.clone());
        Ok(pool)
    }
}

fn to_db_id(id: NodeId) -> Result<i32> {
    i32::try_from(id).map_err(|_| Error::Registry(format!("node id {} out of range", id)))
}

fn from_db_id(id: i32) -> Result<NodeId> {
    NodeId::try_from(id).map_err(|_| Error::Registry(format!("negative node id {} in registry", id)))
}

fn node_from_row(row: &PgRow) -> Result<Node> {
    let node_type: String = row.try_get("type")?;
    let upstream: Option<i32> = row.try_get("upstream_node_id")?;

    Ok(Node {
        id: from_db_id(row.try_get("node_id")?)?,
        node_type: node_type.parse()?,
        upstream_node_id: upstream.map(from_db_id).transpose()?,
        name: row.try_get("node_name")?,
        conninfo: row.try_get("conninfo")?,
        control_address: row.try_get("control_address")?,
        repluser: row.try_get("repluser")?,
        slot_name: row.try_get("slot_name")?,
        location: row.try_get("location")?,
        priority: row.try_get("priority")?,
        active: row.try_get("active")?,
    })
}

#[async_trait::async_trait]
impl NodeRegistry for PgRegistry {
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        let sql = format!("SELECT {} FROM repguard.nodes WHERE node_id = $1", NODE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(to_db_id(id)?)
            .fetch_optional(&self.local)
            .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    async fn get_all_nodes(&self) -> Result<Vec<Node>> {
        let sql = format!("SELECT {} FROM repguard.nodes ORDER BY node_id", NODE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.local).await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn get_primary(&self) -> Result<Option<Node>> {
        let sql = format!(
            "SELECT {} FROM repguard.nodes WHERE type = 'primary' AND active IS TRUE \
             ORDER BY node_id LIMIT 1",
            NODE_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.local).await?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn update_node_role(
        &self,
        id: NodeId,
        node_type: NodeType,
        upstream_node_id: Option<NodeId>,
        active: bool,
    ) -> Result<()> {
        check_upstream(id, upstream_node_id)?;
        let pool = self.primary_pool().await?;

        tracing::debug!(
            "update_node_role(): node {} -> {} (upstream {:?}, active {})",
            id, node_type, upstream_node_id, active
        );

        let result = sqlx::query(
            "UPDATE repguard.nodes SET type = $1, upstream_node_id = $2, active = $3 WHERE node_id = $4",
        )
        .bind(node_type.as_str())
        .bind(upstream_node_id.map(to_db_id).transpose()?)
        .bind(active)
        .bind(to_db_id(id)?)
        .execute(&pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(id));
        }
        Ok(())
    }

    async fn set_node_active(&self, id: NodeId, active: bool) -> Result<()> {
        let pool = self.primary_pool().await?;
        let result = sqlx::query("UPDATE repguard.nodes SET active = $1 WHERE node_id = $2")
            .bind(active)
            .bind(to_db_id(id)?)
            .execute(&pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(id));
        }
        Ok(())
    }

    async fn promote_node(&self, id: NodeId) -> Result<()> {
        let db_id = to_db_id(id)?;
        tracing::debug!("setting node {} as primary and marking existing primary as failed", id);

        let mut tx = self.local.begin().await?;

        sqlx::query(
            "UPDATE repguard.nodes SET active = FALSE \
             WHERE type = 'primary' AND active IS TRUE AND node_id != $1",
        )
        .bind(db_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE repguard.nodes SET type = 'primary', upstream_node_id = NULL, active = TRUE \
             WHERE node_id = $1",
        )
        .bind(db_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::NodeNotFound(id));
        }

        tx.commit().await?;
        self.primaries.write().await.clear();
        Ok(())
    }

    async fn record_event(&self, event: &EventRecord) -> Result<()> {
        let pool = self.primary_pool().await?;
        sqlx::query(
            "INSERT INTO repguard.events (node_id, event, successful, event_timestamp, details) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(to_db_id(event.node_id)?)
        .bind(event.event_type.as_str())
        .bind(event.successful)
        .bind(event.timestamp)
        .bind(&event.details)
        .execute(&pool)
        .await?;
        Ok(())
    }
}
