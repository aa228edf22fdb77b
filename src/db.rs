//! Variable store — the ingestion core's view of the list manager.
//!
//! The core persists only key–value variables: per-stream watermarks,
//! per-kind counters, and stat deltas. [`VarStore`] is the seam to the
//! database; [`MemVarStore`] backs tests and embedders, [`PgVarStore`]
//! stores variables in a PostgreSQL table.
//!
//! # Naming Conventions
//!
//! One variable per `(kind, stream)`:
//! - `cl_last_read_<stream>`, `cl_last_pushed_<stream>`,
//!   `cl_last_cleared_<stream>`, `cl_last_committed_<stream>` — watermark
//!   triples (see [`crate::watermark::Watermark::encode`]).
//! - `cl_count_<stream>_<KIND>` — monotonic per-kind count.
//! - `cl_diff_<stream>_<KIND>` — delta since the previous stat persist.
//! - `cl_diff_interval_<stream>` — seconds between the last two persists.
//!
//! Deprecated names from earlier releases are read once on startup,
//! migrated under the new names, and deleted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::FsMirrorError;
use crate::record::RecordKind;
use crate::watermark::Watermark;

// ── Variable names ─────────────────────────────────────────────────────────

pub const VAR_LAST_READ: &str = "cl_last_read";
pub const VAR_LAST_PUSHED: &str = "cl_last_pushed";
pub const VAR_LAST_CLEARED: &str = "cl_last_cleared";
pub const VAR_LAST_COMMITTED: &str = "cl_last_committed";

/// Deprecated single-value variables, deleted after migration.
pub const VAR_OLD_LAST_READ_REC_ID: &str = "cl_last_read_rec_id_old";
pub const VAR_OLD_DIFF_INTERVAL: &str = "cl_diff_interval_old";

/// `<prefix>_<stream>` for the watermark variables.
pub fn stream_var(prefix: &str, stream: &str) -> String {
    format!("{prefix}_{stream}")
}

/// `cl_count_<stream>_<KIND>`.
pub fn count_var(stream: &str, kind: RecordKind) -> String {
    format!("cl_count_{stream}_{}", kind.as_str())
}

/// `cl_diff_<stream>_<KIND>`.
pub fn diff_var(stream: &str, kind: RecordKind) -> String {
    format!("cl_diff_{stream}_{}", kind.as_str())
}

/// `cl_diff_interval_<stream>`.
pub fn diff_interval_var(stream: &str) -> String {
    format!("cl_diff_interval_{stream}")
}

/// Deprecated per-stream last-committed variable (bare record id).
pub fn old_committed_var(stream: &str) -> String {
    format!("cl_last_committed_old_{stream}")
}

/// Deprecated global per-kind count variable.
pub fn old_count_var(kind: RecordKind) -> String {
    format!("cl_count_old_{}", kind.as_str())
}

/// Deprecated global per-kind diff variable.
pub fn old_diff_var(kind: RecordKind) -> String {
    format!("cl_diff_old_{}", kind.as_str())
}

// ── Store trait ────────────────────────────────────────────────────────────

/// Key–value variable persistence, the only database surface the
/// ingestion core uses.
#[async_trait]
pub trait VarStore: Send + Sync {
    /// Fetch a variable, `None` when unset.
    async fn get_var(&self, name: &str) -> Result<Option<String>, FsMirrorError>;

    /// Set a variable; `None` deletes it.
    async fn set_var(&self, name: &str, value: Option<&str>) -> Result<(), FsMirrorError>;
}

// ── Watermark persistence helpers ──────────────────────────────────────────

/// Store a watermark under `<prefix>_<stream>`. Watermarks that never
/// observed a record (`rec_id == 0`) are not stored, so a restart cannot
/// clobber a previous instance's position.
pub async fn store_watermark(
    store: &dyn VarStore,
    prefix: &str,
    stream: &str,
    mark: &Watermark,
) -> Result<(), FsMirrorError> {
    if mark.rec_id == 0 {
        return Ok(());
    }
    store
        .set_var(&stream_var(prefix, stream), Some(&mark.encode()))
        .await
}

/// Load a watermark stored under `<prefix>_<stream>`.
pub async fn load_watermark(
    store: &dyn VarStore,
    prefix: &str,
    stream: &str,
) -> Result<Option<Watermark>, FsMirrorError> {
    match store.get_var(&stream_var(prefix, stream)).await? {
        Some(value) => Ok(Some(Watermark::decode(&value)?)),
        None => Ok(None),
    }
}

/// Delete every deprecated variable for `stream`.
async fn drop_deprecated_vars(store: &dyn VarStore, stream: &str) -> Result<(), FsMirrorError> {
    store.set_var(&old_committed_var(stream), None).await?;
    store.set_var(VAR_OLD_LAST_READ_REC_ID, None).await?;
    store.set_var(VAR_OLD_DIFF_INTERVAL, None).await?;
    for kind in RecordKind::ALL {
        store.set_var(&old_count_var(kind), None).await?;
        store.set_var(&old_diff_var(kind), None).await?;
    }
    Ok(())
}

/// Load the last durably-committed watermark for `stream`.
///
/// Falls back to the deprecated variable name: the bare record id is
/// rewritten under the new name as a full triple and the deprecated
/// variables are dropped — but only once the new variable was stored, so
/// a failed migration can be retried on the next start.
pub async fn load_last_committed(
    store: &dyn VarStore,
    stream: &str,
) -> Result<Option<Watermark>, FsMirrorError> {
    if let Some(mark) = load_watermark(store, VAR_LAST_COMMITTED, stream).await? {
        return Ok(Some(mark));
    }

    let old_name = old_committed_var(stream);
    let Some(value) = store.get_var(&old_name).await? else {
        return Ok(None);
    };
    let mark = Watermark::decode(&value)?;

    tracing::info!(
        stream,
        old = %old_name,
        rec_id = mark.rec_id,
        "deprecated last-committed variable detected, migrating"
    );

    store_watermark(store, VAR_LAST_COMMITTED, stream, &mark).await?;
    drop_deprecated_vars(store, stream).await?;

    Ok(Some(mark))
}

// ── In-memory store ────────────────────────────────────────────────────────

/// In-memory [`VarStore`], used by the test suite and by embedders that
/// manage persistence themselves.
#[derive(Debug, Default)]
pub struct MemVarStore {
    vars: Mutex<HashMap<String, String>>,
}

impl MemVarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored variable, for assertions.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.vars.lock().expect("var store poisoned").clone()
    }
}

#[async_trait]
impl VarStore for MemVarStore {
    async fn get_var(&self, name: &str) -> Result<Option<String>, FsMirrorError> {
        Ok(self.vars.lock().expect("var store poisoned").get(name).cloned())
    }

    async fn set_var(&self, name: &str, value: Option<&str>) -> Result<(), FsMirrorError> {
        let mut vars = self.vars.lock().expect("var store poisoned");
        match value {
            Some(v) => {
                vars.insert(name.to_string(), v.to_string());
            }
            None => {
                vars.remove(name);
            }
        }
        Ok(())
    }
}

// ── PostgreSQL store ───────────────────────────────────────────────────────

/// [`VarStore`] backed by a single `mirror_vars` table.
pub struct PgVarStore {
    client: tokio_postgres::Client,
}

impl PgVarStore {
    /// Connect and spawn the connection driver task.
    pub async fn connect(conn_str: &str) -> Result<Self, FsMirrorError> {
        let (client, connection) = tokio_postgres::connect(conn_str, tokio_postgres::NoTls)
            .await
            .map_err(|e| FsMirrorError::Db(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "variable store connection failed");
            }
        });

        Ok(PgVarStore { client })
    }

    /// Create the variable table when missing.
    pub async fn init(&self) -> Result<(), FsMirrorError> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS mirror_vars (
                     varname TEXT PRIMARY KEY,
                     value   TEXT NOT NULL
                 )",
            )
            .await
            .map_err(|e| FsMirrorError::Db(e.to_string()))
    }
}

#[async_trait]
impl VarStore for PgVarStore {
    async fn get_var(&self, name: &str) -> Result<Option<String>, FsMirrorError> {
        let row = self
            .client
            .query_opt("SELECT value FROM mirror_vars WHERE varname = $1", &[&name])
            .await
            .map_err(|e| FsMirrorError::Db(e.to_string()))?;
        Ok(row.map(|r| r.get::<_, String>(0)))
    }

    async fn set_var(&self, name: &str, value: Option<&str>) -> Result<(), FsMirrorError> {
        match value {
            Some(v) => self
                .client
                .execute(
                    "INSERT INTO mirror_vars (varname, value) VALUES ($1, $2)
                     ON CONFLICT (varname) DO UPDATE SET value = EXCLUDED.value",
                    &[&name, &v],
                )
                .await
                .map(|_| ())
                .map_err(|e| FsMirrorError::Db(e.to_string())),
            None => self
                .client
                .execute("DELETE FROM mirror_vars WHERE varname = $1", &[&name])
                .await
                .map(|_| ())
                .map_err(|e| FsMirrorError::Db(e.to_string())),
        }
    }
}
