//! Journaled, self-healing storage engine over a single SQLite file.
//!
//! One pool, one write path: every logical write runs as an IMMEDIATE
//! transaction inside a single `interact` closure, serialized through the
//! engine's write gate so concurrent callers never interleave. Transient
//! lock contention is retried with jittered backoff before surfacing as a
//! terminal [`EmberError::Busy`]; structural damage flips the engine into a
//! degraded state that [`StorageEngine::recover`] repairs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use deadpool_sqlite::{
    rusqlite::{self, params, ErrorCode, OptionalExtension},
    Config as DeadpoolSqliteConfig, Pool as DeadpoolSqlitePool, Runtime as DeadpoolRuntime,
};
use once_cell::sync::Lazy;
use rand::rngs::SysRng;
use rand::TryRng;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::EmberError;
use crate::Result;

mod backup;
mod schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn from_db(raw: &str) -> rusqlite::Result<Self> {
        match raw {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown role: {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    pub position: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Name,
    Location,
    Age,
    Interest,
    Note,
}

impl FactCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactCategory::Name => "name",
            FactCategory::Location => "location",
            FactCategory::Age => "age",
            FactCategory::Interest => "interest",
            FactCategory::Note => "note",
        }
    }

    /// Name, location, and age carry at most one current value; interests
    /// and notes form capped sets.
    pub fn is_single_valued(&self) -> bool {
        matches!(
            self,
            FactCategory::Name | FactCategory::Location | FactCategory::Age
        )
    }

    fn from_db(raw: &str) -> rusqlite::Result<Self> {
        match raw {
            "name" => Ok(FactCategory::Name),
            "location" => Ok(FactCategory::Location),
            "age" => Ok(FactCategory::Age),
            "interest" => Ok(FactCategory::Interest),
            "note" => Ok(FactCategory::Note),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown fact category: {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Fact {
    pub id: i64,
    pub category: FactCategory,
    pub value: String,
    pub session_id: Option<i64>,
    pub message_id: Option<i64>,
    pub confidence: Option<f64>,
    pub updated_at: i64,
}

/// Provenance of a learned fact.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactSource {
    pub session_id: Option<i64>,
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum FactWrite {
    /// Inserted, or replaced the prior value of a single-valued category.
    Stored(Fact),
    /// Case-insensitive duplicate of an existing multi-valued entry.
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub findings: Vec<String>,
    /// Set when a failing check triggered the recovery path.
    pub recovery: Option<RecoveryOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The write-ahead journal was replayed/discarded and the file verified.
    JournalReplayed,
    /// The named backup snapshot was restored over the damaged file.
    RestoredFromBackup(String),
    /// Last resort: an empty schema was reinitialized; prior data is lost.
    Reinitialized,
}

static SESSION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9äöüßÄÖÜ\s_-]+$").expect("static pattern"));

pub struct StorageEngine {
    cfg: StoreConfig,
    pool: RwLock<DeadpoolSqlitePool>,
    write_gate: Mutex<()>,
    corrupted: AtomicBool,
    /// Bumped when a recovery pass starts and again when it finishes, so a
    /// reader that raced the repair cannot re-flag corruption afterwards.
    recovery_epoch: AtomicU64,
    writes_since_backup: AtomicU64,
}

impl StorageEngine {
    /// Opens (creating if absent) the database file, enables write-ahead
    /// journaling, verifies the schema version and applies pending
    /// migrations.
    ///
    /// A structurally damaged file is not fatal: the handle comes back
    /// degraded with [`is_corrupted`](Self::is_corrupted) set, and the caller
    /// decides when to run [`recover`](Self::recover). Only an unopenable
    /// path surfaces as [`EmberError::StorageUnavailable`].
    pub async fn open(cfg: StoreConfig) -> Result<Self> {
        if let Some(parent) = cfg.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EmberError::StorageUnavailable(format!("create {}: {e}", parent.display()))
            })?;
        }

        let pool = build_pool(&cfg.db_path)?;
        let engine = Self {
            cfg,
            pool: RwLock::new(pool),
            write_gate: Mutex::new(()),
            corrupted: AtomicBool::new(false),
            recovery_epoch: AtomicU64::new(0),
            writes_since_backup: AtomicU64::new(0),
        };

        match engine.initialize().await {
            Ok(()) => {}
            Err(err) if err.is_corrupt() => {
                warn!(error = %err, "opened degraded: structural damage detected, recover() required");
                engine.corrupted.store(true, Ordering::SeqCst);
            }
            Err(err) => return Err(err),
        }

        Ok(engine)
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::SeqCst)
    }

    pub fn db_path(&self) -> &Path {
        &self.cfg.db_path
    }

    async fn initialize(&self) -> Result<()> {
        enum Probe {
            Damaged(String),
            Healthy { version: i64 },
        }

        let busy = self.cfg.busy_timeout_ms;
        let probe = self
            .interact("open", move |conn| {
                schema::tune_connection(conn, busy)?;
                let _mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
                conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
                let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
                if !verdict.eq_ignore_ascii_case("ok") {
                    return Ok(Probe::Damaged(verdict));
                }
                let version = schema::schema_version(conn)?;
                Ok(Probe::Healthy { version })
            })
            .await?;

        let version = match probe {
            Probe::Damaged(verdict) => {
                return Err(EmberError::Corrupt(format!("quick_check: {verdict}")))
            }
            Probe::Healthy { version } => version,
        };

        if version > schema::SCHEMA_VERSION {
            return Err(EmberError::StorageUnavailable(format!(
                "on-disk schema v{version} is newer than supported v{}",
                schema::SCHEMA_VERSION
            )));
        }

        if version < schema::SCHEMA_VERSION {
            if version > 0 {
                // real data predates this schema: snapshot before touching it
                self.backup_now().await?;
            }
            let busy = self.cfg.busy_timeout_ms;
            self.interact("migrate", move |conn| {
                schema::tune_connection(conn, busy)?;
                schema::apply_migrations(conn, version)
            })
            .await?;
            info!(from = version, to = schema::SCHEMA_VERSION, "schema migrated");
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // write / query plumbing
    // ------------------------------------------------------------------

    async fn interact<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let epoch = self.recovery_epoch.load(Ordering::SeqCst);
        let pool = self.pool.read().await.clone();
        let conn = pool
            .get()
            .await
            .map_err(|e| EmberError::StorageUnavailable(e.to_string()))?;
        let result = conn
            .interact(f)
            .await
            .map_err(|e| EmberError::Runtime(format!("{op}: {e}")))?
            .map_err(|e| classify(op, e));
        if let Err(err) = &result {
            // a call that overlapped a recovery pass saw a file that may
            // already be repaired; only same-epoch failures flag the engine
            if err.is_corrupt() && self.recovery_epoch.load(Ordering::SeqCst) == epoch {
                self.corrupted.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    /// Runs one logical write as an atomic IMMEDIATE transaction, serialized
    /// through the write gate. Busy errors are retried up to the configured
    /// bound with jittered backoff; constraint violations are never retried.
    async fn execute<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(&rusqlite::Transaction<'_>) -> rusqlite::Result<T> + Send + Clone + 'static,
        T: Send + 'static,
    {
        let _gate = self.write_gate.lock().await;
        let max_attempts = self.cfg.max_write_attempts.max(1);
        let busy = self.cfg.busy_timeout_ms;

        let mut attempt = 1;
        loop {
            let job = f.clone();
            let result = self
                .interact(op, move |conn| {
                    schema::tune_connection(conn, busy)?;
                    let tx = conn
                        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                    let value = job(&tx)?;
                    tx.commit()?;
                    Ok(value)
                })
                .await;

            match result {
                Ok(value) => {
                    self.after_write().await;
                    return Ok(value);
                }
                Err(err) if err.is_busy() && attempt < max_attempts => {
                    let delay = busy_backoff(self.cfg.busy_backoff_base_ms, attempt);
                    warn!(
                        op,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "write contention, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Read-only access; never takes the write gate, bounded by the
    /// connection's busy timeout.
    async fn query<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let busy = self.cfg.busy_timeout_ms;
        self.interact(op, move |conn| {
            schema::tune_connection(conn, busy)?;
            f(conn)
        })
        .await
    }

    /// Operation-count backup cadence; failures degrade to a warning so the
    /// write that triggered the snapshot still succeeds.
    async fn after_write(&self) {
        if self.cfg.backup_every_ops == 0 {
            return;
        }
        let count = self.writes_since_backup.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.cfg.backup_every_ops == 0 {
            if let Err(err) = self.backup_now().await {
                warn!(error = %err, "periodic backup failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // integrity / backup / recovery
    // ------------------------------------------------------------------

    /// Structural self-check. A failing report triggers the recovery path
    /// and records the outcome.
    pub async fn check_integrity(&self) -> Result<IntegrityReport> {
        let busy = self.cfg.busy_timeout_ms;
        let findings = self
            .interact("integrity_check", move |conn| {
                schema::tune_connection(conn, busy)?;
                let mut stmt = conn.prepare("PRAGMA integrity_check")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut findings = Vec::new();
                for row in rows {
                    findings.push(row?);
                }
                Ok(findings)
            })
            .await;

        let findings = match findings {
            Ok(findings) => findings,
            Err(err) if err.is_corrupt() => vec![err.to_string()],
            Err(err) => return Err(err),
        };

        let ok = findings.len() == 1 && findings[0].eq_ignore_ascii_case("ok");
        if ok {
            return Ok(IntegrityReport {
                ok: true,
                findings: Vec::new(),
                recovery: None,
            });
        }

        self.corrupted.store(true, Ordering::SeqCst);
        warn!(?findings, "integrity check failed, starting recovery");
        let outcome = self.recover().await?;
        Ok(IntegrityReport {
            ok: false,
            findings,
            recovery: Some(outcome),
        })
    }

    /// Snapshots the database to a timestamped file under the backup
    /// directory via `VACUUM INTO`, pruning old snapshots beyond the
    /// configured bound. Returns `None` when there is nothing to snapshot.
    pub async fn backup_now(&self) -> Result<Option<PathBuf>> {
        let has_data = std::fs::metadata(&self.cfg.db_path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if !has_data {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.cfg.backup_dir)
            .map_err(|e| EmberError::Runtime(format!("create backup dir: {e}")))?;
        let target = backup::next_snapshot_path(&self.cfg.backup_dir);
        let target_arg = target.to_string_lossy().to_string();
        let busy = self.cfg.busy_timeout_ms;
        self.interact("backup", move |conn| {
            schema::tune_connection(conn, busy)?;
            conn.execute("VACUUM INTO ?1", params![target_arg])?;
            Ok(())
        })
        .await?;

        backup::prune(&self.cfg.backup_dir, self.cfg.max_backups);
        info!(path = %target.display(), "database snapshot written");
        Ok(Some(target))
    }

    /// Repairs a damaged database, in order: replay/discard the write-ahead
    /// journal, restore the newest healthy backup snapshot, or reinitialize
    /// an empty schema as last resort. Idempotent: a second call without
    /// intervening writes re-verifies and leaves the same end state.
    pub async fn recover(&self) -> Result<RecoveryOutcome> {
        let _gate = self.write_gate.lock().await;
        self.recovery_epoch.fetch_add(1, Ordering::SeqCst);
        let outcome = self.repair().await?;
        // Second bump before the clear: readers that queried the file
        // mid-repair carry a stale epoch and cannot undo the clear.
        self.recovery_epoch.fetch_add(1, Ordering::SeqCst);
        self.corrupted.store(false, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn repair(&self) -> Result<RecoveryOutcome> {
        // Fresh pool so the checkpoint is not blocked by pooled handles.
        self.refresh_pool().await?;
        if self.checkpoint_and_verify().await? {
            info!("recovery: write-ahead journal replayed, structure verified");
            return Ok(RecoveryOutcome::JournalReplayed);
        }

        for candidate in backup::list_newest_first(&self.cfg.backup_dir) {
            if !backup_is_healthy(&candidate).await {
                warn!(path = %candidate.display(), "skipping damaged backup snapshot");
                continue;
            }
            self.swap_in_file(&candidate).await?;
            if self.checkpoint_and_verify().await? {
                let name = candidate
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                warn!(backup = %name, "recovery: restored from backup snapshot");
                return Ok(RecoveryOutcome::RestoredFromBackup(name));
            }
        }

        self.reinitialize().await?;
        Ok(RecoveryOutcome::Reinitialized)
    }

    /// Checkpoints the journal and verifies structure plus schema version.
    /// `Ok(false)` means the file is still unusable.
    async fn checkpoint_and_verify(&self) -> Result<bool> {
        let busy = self.cfg.busy_timeout_ms;
        let outcome = self
            .interact("recover_verify", move |conn| {
                schema::tune_connection(conn, busy)?;
                let _mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
                let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()));
                let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
                if !verdict.eq_ignore_ascii_case("ok") {
                    return Ok(false);
                }
                let version = schema::schema_version(conn)?;
                if version < schema::SCHEMA_VERSION {
                    schema::apply_migrations(conn, version)?;
                }
                Ok(true)
            })
            .await;

        match outcome {
            Ok(healthy) => Ok(healthy),
            Err(err) if err.is_corrupt() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn refresh_pool(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        let fresh = build_pool(&self.cfg.db_path)?;
        let old = std::mem::replace(&mut *guard, fresh);
        drop(guard);
        drop(old);
        Ok(())
    }

    /// Copies a backup over the main file. The replacement pool opens its
    /// connections lazily, after the copy.
    async fn swap_in_file(&self, source: &Path) -> Result<()> {
        let mut guard = self.pool.write().await;
        let fresh = build_pool(&self.cfg.db_path)?;
        let old = std::mem::replace(&mut *guard, fresh);
        drop(old);
        remove_sidecars(&self.cfg.db_path);
        std::fs::copy(source, &self.cfg.db_path)
            .map_err(|e| EmberError::Runtime(format!("restore copy: {e}")))?;
        Ok(())
    }

    async fn reinitialize(&self) -> Result<()> {
        {
            let mut guard = self.pool.write().await;
            let fresh = build_pool(&self.cfg.db_path)?;
            let old = std::mem::replace(&mut *guard, fresh);
            drop(old);
            remove_sidecars(&self.cfg.db_path);
            if let Err(err) = std::fs::remove_file(&self.cfg.db_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(EmberError::StorageUnavailable(format!(
                        "remove damaged file: {err}"
                    )));
                }
            }
        }

        let busy = self.cfg.busy_timeout_ms;
        self.interact("reinitialize", move |conn| {
            schema::tune_connection(conn, busy)?;
            let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            let version = schema::schema_version(conn)?;
            schema::apply_migrations(conn, version)?;
            Ok(())
        })
        .await?;

        warn!("recovery: reinitialized empty schema; previous contents were unrecoverable");
        Ok(())
    }

    // ------------------------------------------------------------------
    // sessions
    // ------------------------------------------------------------------

    pub async fn create_session(&self, name: &str) -> Result<ChatSession> {
        let name = validate_session_name(name, self.cfg.max_session_name_len)?;
        let now = now_ts()?;
        self.execute("create_session", move |tx| {
            tx.execute(
                "INSERT INTO sessions (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![name, now],
            )?;
            Ok(ChatSession {
                id: tx.last_insert_rowid(),
                name: name.clone(),
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    pub async fn session_by_name(&self, name: &str) -> Result<Option<ChatSession>> {
        let name = name.to_string();
        self.query("session_by_name", move |conn| {
            conn.query_row(
                "SELECT id, name, created_at, updated_at FROM sessions WHERE name = ?1",
                params![name],
                session_from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        self.query("list_sessions", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, created_at, updated_at FROM sessions ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], session_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Returns `false` when no session carries `id`.
    pub async fn rename_session(&self, id: i64, new_name: &str) -> Result<bool> {
        let new_name = validate_session_name(new_name, self.cfg.max_session_name_len)?;
        let now = now_ts()?;
        self.execute("rename_session", move |tx| {
            let changed = tx.execute(
                "UPDATE sessions SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![new_name, now, id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Deletes a session and, via cascade, its messages. Destructive, so a
    /// best-effort snapshot is taken first.
    pub async fn delete_session(&self, id: i64) -> Result<bool> {
        if let Err(err) = self.backup_now().await {
            warn!(error = %err, "pre-delete backup failed, deleting anyway");
        }
        self.execute("delete_session", move |tx| {
            let changed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    // ------------------------------------------------------------------
    // messages
    // ------------------------------------------------------------------

    /// Appends a message, assigning the next sequence position under the
    /// write gate: concurrent appends to one session come out contiguous,
    /// gapless, and in arrival order.
    pub async fn append_message(
        &self,
        session_id: i64,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage> {
        let content = truncate_chars(content.trim(), self.cfg.max_message_len);
        let now = now_ts()?;
        self.execute("append_message", move |tx| {
            let position: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (session_id, role, content, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, role.as_str(), content, position, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now, session_id],
            )?;
            Ok(StoredMessage {
                id,
                session_id,
                role,
                content: content.clone(),
                position,
                created_at: now,
            })
        })
        .await
    }

    /// All messages of a session ordered by sequence position.
    pub async fn messages(&self, session_id: i64) -> Result<Vec<StoredMessage>> {
        self.query("messages", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, position, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY position ASC",
            )?;
            let rows = stmt.query_map(params![session_id], message_from_row)?;
            rows.collect()
        })
        .await
    }

    // ------------------------------------------------------------------
    // facts
    // ------------------------------------------------------------------

    /// Persists a learned fact. Single-valued categories replace their prior
    /// value (last write wins); multi-valued categories skip case-insensitive
    /// duplicates and evict the oldest entries beyond `cap`.
    pub async fn store_fact(
        &self,
        category: FactCategory,
        value: &str,
        source: FactSource,
        confidence: f64,
        cap: usize,
    ) -> Result<FactWrite> {
        let value = value.to_string();
        // SQLite's lower() only folds ASCII, so the duplicate check folds in
        // Rust against the category's stored values.
        let folded = value.to_lowercase();
        let now = now_ts()?;
        self.execute("store_fact", move |tx| {
            if category.is_single_valued() {
                let id: i64 = tx.query_row(
                    "INSERT INTO facts (category, value, session_id, message_id, confidence, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(category) WHERE category IN ('name', 'location', 'age')
                     DO UPDATE SET value = excluded.value,
                                   session_id = excluded.session_id,
                                   message_id = excluded.message_id,
                                   confidence = excluded.confidence,
                                   updated_at = excluded.updated_at
                     RETURNING id",
                    params![
                        category.as_str(),
                        value,
                        source.session_id,
                        source.message_id,
                        confidence,
                        now
                    ],
                    |row| row.get(0),
                )?;
                return Ok(FactWrite::Stored(Fact {
                    id,
                    category,
                    value: value.clone(),
                    session_id: source.session_id,
                    message_id: source.message_id,
                    confidence: Some(confidence),
                    updated_at: now,
                }));
            }

            let duplicate = {
                let mut stmt = tx.prepare("SELECT value FROM facts WHERE category = ?1")?;
                let mut rows = stmt.query(params![category.as_str()])?;
                let mut found = false;
                while let Some(row) = rows.next()? {
                    let existing: String = row.get(0)?;
                    if existing.to_lowercase() == folded {
                        found = true;
                        break;
                    }
                }
                found
            };
            if duplicate {
                return Ok(FactWrite::Duplicate);
            }

            tx.execute(
                "INSERT INTO facts (category, value, session_id, message_id, confidence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    category.as_str(),
                    value,
                    source.session_id,
                    source.message_id,
                    confidence,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();

            // oldest entries beyond the cap make room for the new one
            tx.execute(
                "DELETE FROM facts WHERE category = ?1 AND id NOT IN (
                     SELECT id FROM facts WHERE category = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![category.as_str(), cap as i64],
            )?;

            Ok(FactWrite::Stored(Fact {
                id,
                category,
                value: value.clone(),
                session_id: source.session_id,
                message_id: source.message_id,
                confidence: Some(confidence),
                updated_at: now,
            }))
        })
        .await
    }

    /// All facts in insertion order; the memory manager derives its working
    /// set from this on every call.
    pub async fn facts(&self) -> Result<Vec<Fact>> {
        self.query("facts", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category, value, session_id, message_id, confidence, updated_at
                 FROM facts ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], fact_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Clears the entire fact store. Destructive, so snapshot first.
    pub async fn clear_facts(&self) -> Result<()> {
        if let Err(err) = self.backup_now().await {
            warn!(error = %err, "pre-clear backup failed, clearing anyway");
        }
        self.execute("clear_facts", move |tx| {
            tx.execute("DELETE FROM facts", [])?;
            Ok(())
        })
        .await
    }
}

// ----------------------------------------------------------------------
// helpers
// ----------------------------------------------------------------------

fn build_pool(db_path: &Path) -> Result<DeadpoolSqlitePool> {
    DeadpoolSqliteConfig::new(db_path)
        .create_pool(DeadpoolRuntime::Tokio1)
        .map_err(|e| EmberError::StorageUnavailable(e.to_string()))
}

fn remove_sidecars(db_path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut os_string = db_path.as_os_str().to_owned();
        os_string.push(suffix);
        let sidecar = PathBuf::from(os_string);
        if let Err(err) = std::fs::remove_file(&sidecar) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %sidecar.display(), error = %err, "could not remove journal sidecar");
            }
        }
    }
}

async fn backup_is_healthy(path: &Path) -> bool {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let Ok(conn) = rusqlite::Connection::open(&path) else {
            return false;
        };
        conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .map(|verdict| verdict.eq_ignore_ascii_case("ok"))
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

fn classify(op: &'static str, err: rusqlite::Error) -> EmberError {
    if let rusqlite::Error::SqliteFailure(code, ref message) = err {
        let detail = message.clone().unwrap_or_else(|| code.to_string());
        let text = format!("{op}: {detail}");
        return match code.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => EmberError::Busy(text),
            ErrorCode::ConstraintViolation => EmberError::ConstraintViolation(text),
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => EmberError::Corrupt(text),
            _ => EmberError::Runtime(text),
        };
    }

    let message = format!("{op}: {err}");
    if is_sqlite_locked_error(&message) {
        EmberError::Busy(message)
    } else if message.contains("malformed") || message.contains("not a database") {
        EmberError::Corrupt(message)
    } else {
        EmberError::Runtime(message)
    }
}

fn is_sqlite_locked_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("sqlite_busy")
}

/// Linear backoff with random jitter so colliding writers desynchronize.
fn busy_backoff(base_ms: u64, attempt: u32) -> Duration {
    let base_ms = base_ms.max(1);
    let mut bytes = [0u8; 2];
    let mut rng = SysRng;
    let jitter = match rng.try_fill_bytes(&mut bytes) {
        Ok(()) => u64::from(u16::from_le_bytes(bytes)) % base_ms,
        Err(_) => 0,
    };
    Duration::from_millis(base_ms * u64::from(attempt) + jitter)
}

fn now_ts() -> Result<i64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| EmberError::Runtime(e.to_string()))?
        .as_secs() as i64)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn validate_session_name(name: &str, max_len: usize) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > max_len || !SESSION_NAME_RE.is_match(name) {
        return Err(EmberError::ConstraintViolation(format!(
            "invalid session name: {name:?}"
        )));
    }
    Ok(name.to_string())
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    Ok(ChatSession {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::from_db(&role)?,
        content: row.get(3)?,
        position: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let category: String = row.get(1)?;
    Ok(Fact {
        id: row.get(0)?,
        category: FactCategory::from_db(&category)?,
        value: row.get(2)?,
        session_id: row.get(3)?,
        message_id: row.get(4)?,
        confidence: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
