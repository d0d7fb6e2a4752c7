//! Durable stream message bus on an embedded libSQL database.
//!
//! The [`StreamBus`] keeps an append-only log per topic and consumer-group
//! state over it: a cursor per group, the last delivered id per consumer, and
//! a pending set of delivered-but-unacknowledged entries.
//!
//! **Concurrency rules:**
//! - every mutation runs inside an immediate (write-locking) transaction, so
//!   handles in different processes never hand the same message to two
//!   consumers of one group
//! - within one handle, operations are serialized by an async mutex

mod dead_letter;
mod migrations;

pub use dead_letter::{DeadLetter, DeadLetterSink, TracingSink};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database, Transaction, TransactionBehavior, params};
use ravedigest_shared::{BusConfig, DigestError, Message, MessageId, Payload, Result};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Tuning knobs that are not per-call arguments.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Delivery count at which reclaim dead-letters instead of redelivering.
    pub max_deliveries: u32,
    /// Re-check interval while a claim is blocked.
    pub poll_interval: Duration,
    /// How long a write waits for another process holding the lock.
    pub busy_timeout: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            poll_interval: Duration::from_millis(200),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&BusConfig> for BusOptions {
    fn from(config: &BusConfig) -> Self {
        Self {
            max_deliveries: config.max_deliveries.max(1),
            poll_interval: config.poll_interval(),
            ..Self::default()
        }
    }
}

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Deliver everything already in the topic.
    Beginning,
    /// Deliver only messages appended after the group was created.
    Latest,
}

/// Retention policy for [`StreamBus::trim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimPolicy {
    /// Keep the newest `n` messages.
    MaxLen(u64),
    /// Drop messages appended longer ago than this.
    MaxAge(Duration),
}

/// One entry of a group's pending set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEntry {
    pub id: MessageId,
    pub consumer: String,
    pub delivered_at: DateTime<Utc>,
    pub delivery_count: u32,
}

/// Per-group counters, as shown by `bus stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStats {
    pub group: String,
    pub cursor: MessageId,
    pub pending: u64,
    pub lag: u64,
    pub dead_letters: u64,
}

/// Per-topic counters, as shown by `bus stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub length: u64,
    pub last_id: MessageId,
    pub groups: Vec<GroupStats>,
}

fn bus_err(e: libsql::Error) -> DigestError {
    DigestError::Bus(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Primary bus handle wrapping a libSQL database.
pub struct StreamBus {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    lock: Mutex<()>,
    appended: Notify,
    options: BusOptions,
    sink: Arc<dyn DeadLetterSink>,
}

impl StreamBus {
    /// Open or create the bus database at `path`, apply migrations and probe it.
    pub async fn open(path: &Path, options: BusOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DigestError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(bus_err)?;
        let conn = db.connect().map_err(bus_err)?;

        let bus = Self {
            db,
            conn,
            lock: Mutex::new(()),
            appended: Notify::new(),
            options,
            sink: Arc::new(TracingSink),
        };
        bus.configure().await?;
        bus.run_migrations().await?;
        bus.ping().await?;
        tracing::info!(path = %path.display(), "message bus opened");
        Ok(bus)
    }

    /// Replace the dead-letter sink.
    pub fn with_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    async fn configure(&self) -> Result<()> {
        let timeout_ms = self.options.busy_timeout.as_millis() as u64;
        for pragma in [
            format!("PRAGMA busy_timeout = {timeout_ms}"),
            "PRAGMA journal_mode = WAL".to_string(),
        ] {
            let mut rows = self.conn.query(&pragma, params![]).await.map_err(bus_err)?;
            rows.next().await.map_err(bus_err)?;
        }
        Ok(())
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DigestError::Bus(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Readiness probe: the database answers a trivial query.
    pub async fn ping(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut rows = self.conn.query("SELECT 1", params![]).await.map_err(bus_err)?;
        match rows.next().await.map_err(bus_err)? {
            Some(_) => Ok(()),
            None => Err(DigestError::Bus("probe query returned no row".into())),
        }
    }

    async fn begin(&self) -> Result<Transaction> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(bus_err)
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(tx: Transaction, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                tx.commit().await.map_err(bus_err)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Topics and groups
    // -----------------------------------------------------------------------

    /// Create a topic. Existing topics are left alone.
    pub async fn create_topic(&self, topic: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO topics (name, next_id, created_at) VALUES (?1, 1, ?2)",
                params![topic, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(bus_err)?;
        Ok(())
    }

    /// Create a consumer group. An existing group keeps its cursor.
    pub async fn create_group(&self, topic: &str, group: &str, start: StartFrom) -> Result<()> {
        let _guard = self.lock.lock().await;
        let tx = self.begin().await?;
        let result: Result<()> = async {
            let next = next_id(&tx, topic).await?;
            let cursor = match start {
                StartFrom::Beginning => 0,
                StartFrom::Latest => next - 1,
            };
            tx.execute(
                "INSERT OR IGNORE INTO consumer_groups (topic, name, last_delivered_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![topic, group, cursor, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(bus_err)?;
            Ok(())
        }
        .await;
        Self::finish(tx, result).await
    }

    // -----------------------------------------------------------------------
    // Producing
    // -----------------------------------------------------------------------

    /// Append a message and return its id.
    pub async fn append(&self, topic: &str, payload: &Payload) -> Result<MessageId> {
        let json = payload.to_json()?;
        let id = {
            let _guard = self.lock.lock().await;
            let tx = self.begin().await?;
            let result = append_in(&tx, topic, &json).await;
            Self::finish(tx, result).await?
        };
        self.appended.notify_waiters();
        tracing::debug!(topic, %id, "appended");
        Ok(id)
    }

    /// Append unless `dedupe_key` was already appended to `topic`.
    ///
    /// Returns `None` for a duplicate.
    pub async fn append_once(
        &self,
        topic: &str,
        dedupe_key: &str,
        payload: &Payload,
    ) -> Result<Option<MessageId>> {
        let json = payload.to_json()?;
        let id = {
            let _guard = self.lock.lock().await;
            let tx = self.begin().await?;
            let result: Result<Option<MessageId>> = async {
                next_id(&tx, topic).await?;
                let seen = count(
                    &tx,
                    "SELECT COUNT(*) FROM dedupe_keys WHERE topic = ?1 AND key = ?2",
                    params![topic, dedupe_key],
                )
                .await?;
                if seen > 0 {
                    return Ok(None);
                }
                let id = append_in(&tx, topic, &json).await?;
                tx.execute(
                    "INSERT INTO dedupe_keys (topic, key, message_id, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![topic, dedupe_key, id.0, Utc::now().to_rfc3339()],
                )
                .await
                .map_err(bus_err)?;
                Ok(Some(id))
            }
            .await;
            Self::finish(tx, result).await?
        };
        match id {
            Some(id) => {
                self.appended.notify_waiters();
                tracing::debug!(topic, %id, "appended");
            }
            None => tracing::debug!(topic, dedupe_key, "duplicate skipped"),
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Consuming
    // -----------------------------------------------------------------------

    /// Claim up to `max_count` unseen messages for `consumer`, in id order.
    ///
    /// Claimed messages enter the group's pending set with a delivery count
    /// of 1. With nothing to deliver, waits up to `block_timeout` for an
    /// append and returns empty if none arrives. A stored payload that no
    /// longer decodes is dead-lettered and skipped.
    pub async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: u32,
        block_timeout: Duration,
    ) -> Result<Vec<Message>> {
        let deadline = Instant::now() + block_timeout;
        let max_count = max_count.max(1);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, dead) = {
                let _guard = self.lock.lock().await;
                let tx = self.begin().await?;
                let result = claim_in(&tx, topic, group, consumer, max_count).await;
                Self::finish(tx, result).await?
            };
            for letter in &dead {
                self.sink.report(letter);
            }
            if !batch.is_empty() {
                tracing::debug!(topic, group, consumer, count = batch.len(), "claimed");
                return Ok(batch);
            }
            if !dead.is_empty() {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(self.options.poll_interval);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Remove a pending entry. Returns whether one was removed; acknowledging
    /// twice is not an error.
    pub async fn acknowledge(&self, topic: &str, group: &str, id: MessageId) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let removed = self
            .conn
            .execute(
                "DELETE FROM pending WHERE topic = ?1 AND group_name = ?2 AND message_id = ?3",
                params![topic, group, id.0],
            )
            .await
            .map_err(bus_err)?;
        Ok(removed > 0)
    }

    /// Re-deliver pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// Entries that already reached `max_deliveries` are moved to the dead
    /// letters instead and reported once through the sink.
    pub async fn reclaim_stalled(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<Message>> {
        let (reclaimed, dead) = {
            let _guard = self.lock.lock().await;
            let tx = self.begin().await?;
            let result = reclaim_in(
                &tx,
                topic,
                group,
                consumer,
                min_idle,
                self.options.max_deliveries,
            )
            .await;
            Self::finish(tx, result).await?
        };

        for letter in &dead {
            self.sink.report(letter);
        }
        if !reclaimed.is_empty() || !dead.is_empty() {
            tracing::info!(
                topic,
                group,
                consumer,
                reclaimed = reclaimed.len(),
                dead_lettered = dead.len(),
                "reclaimed stalled entries"
            );
        }
        Ok(reclaimed)
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Drop old messages per `policy`. Messages still pending in any group
    /// are kept. Returns the number removed.
    pub async fn trim(&self, topic: &str, policy: TrimPolicy) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let tx = self.begin().await?;
        let result: Result<u64> = async {
            next_id(&tx, topic).await?;
            let removed = match policy {
                TrimPolicy::MaxLen(n) => tx
                    .execute(
                        "DELETE FROM messages
                         WHERE topic = ?1
                           AND id NOT IN (SELECT id FROM messages WHERE topic = ?1
                                          ORDER BY id DESC LIMIT ?2)
                           AND NOT EXISTS (SELECT 1 FROM pending p
                                           WHERE p.topic = messages.topic
                                             AND p.message_id = messages.id)",
                        params![topic, n as i64],
                    )
                    .await
                    .map_err(bus_err)?,
                TrimPolicy::MaxAge(age) => tx
                    .execute(
                        "DELETE FROM messages
                         WHERE topic = ?1
                           AND appended_at < ?2
                           AND NOT EXISTS (SELECT 1 FROM pending p
                                           WHERE p.topic = messages.topic
                                             AND p.message_id = messages.id)",
                        params![topic, now_ms() - age.as_millis() as i64],
                    )
                    .await
                    .map_err(bus_err)?,
            };
            Ok(removed)
        }
        .await;
        let removed = Self::finish(tx, result).await?;
        if removed > 0 {
            tracing::debug!(topic, removed, "trimmed");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Pending set of a group, in id order.
    pub async fn pending(&self, topic: &str, group: &str) -> Result<Vec<PendingEntry>> {
        let _guard = self.lock.lock().await;
        group_cursor(&self.conn, topic, group).await?;
        let mut rows = self
            .conn
            .query(
                "SELECT message_id, consumer, delivered_at, delivery_count FROM pending
                 WHERE topic = ?1 AND group_name = ?2 ORDER BY message_id",
                params![topic, group],
            )
            .await
            .map_err(bus_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(bus_err)? {
            entries.push(PendingEntry {
                id: MessageId(row.get::<i64>(0).map_err(bus_err)?),
                consumer: row.get::<String>(1).map_err(bus_err)?,
                delivered_at: from_ms(row.get::<i64>(2).map_err(bus_err)?),
                delivery_count: row.get::<u32>(3).map_err(bus_err)?,
            });
        }
        Ok(entries)
    }

    /// Messages not yet delivered to the group plus its pending entries.
    pub async fn lag(&self, topic: &str, group: &str) -> Result<u64> {
        let _guard = self.lock.lock().await;
        lag_in(&self.conn, topic, group).await
    }

    /// Number of messages currently retained in `topic`.
    pub async fn topic_len(&self, topic: &str) -> Result<u64> {
        let _guard = self.lock.lock().await;
        next_id(&self.conn, topic).await?;
        count(
            &self.conn,
            "SELECT COUNT(*) FROM messages WHERE topic = ?1",
            params![topic],
        )
        .await
    }

    /// Dead letters recorded for a group, in id order.
    pub async fn dead_letters(&self, topic: &str, group: &str) -> Result<Vec<DeadLetter>> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT message_id, consumer, delivery_count, payload, dead_at FROM dead_letters
                 WHERE topic = ?1 AND group_name = ?2 ORDER BY message_id",
                params![topic, group],
            )
            .await
            .map_err(bus_err)?;

        let mut letters = Vec::new();
        while let Some(row) = rows.next().await.map_err(bus_err)? {
            let dead_at = row.get::<String>(4).map_err(bus_err)?;
            letters.push(DeadLetter {
                topic: topic.to_string(),
                group: group.to_string(),
                id: MessageId(row.get::<i64>(0).map_err(bus_err)?),
                consumer: row.get::<String>(1).map_err(bus_err)?,
                delivery_count: row.get::<u32>(2).map_err(bus_err)?,
                // undecodable payloads are listed empty
                payload: Payload::from_json(&row.get::<String>(3).map_err(bus_err)?)
                    .unwrap_or_default(),
                dead_at: DateTime::parse_from_rfc3339(&dead_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_default(),
            });
        }
        Ok(letters)
    }

    /// Counters for every topic and group.
    pub async fn stats(&self) -> Result<Vec<TopicStats>> {
        let _guard = self.lock.lock().await;
        let mut topics = Vec::new();
        {
            let mut rows = self
                .conn
                .query("SELECT name, next_id FROM topics ORDER BY name", params![])
                .await
                .map_err(bus_err)?;
            while let Some(row) = rows.next().await.map_err(bus_err)? {
                topics.push((
                    row.get::<String>(0).map_err(bus_err)?,
                    row.get::<i64>(1).map_err(bus_err)?,
                ));
            }
        }

        let mut stats = Vec::new();
        for (topic, next) in topics {
            let length = count(
                &self.conn,
                "SELECT COUNT(*) FROM messages WHERE topic = ?1",
                params![topic.as_str()],
            )
            .await?;

            let mut groups = Vec::new();
            {
                let mut rows = self
                    .conn
                    .query(
                        "SELECT name, last_delivered_id FROM consumer_groups
                         WHERE topic = ?1 ORDER BY name",
                        params![topic.as_str()],
                    )
                    .await
                    .map_err(bus_err)?;
                while let Some(row) = rows.next().await.map_err(bus_err)? {
                    groups.push((
                        row.get::<String>(0).map_err(bus_err)?,
                        row.get::<i64>(1).map_err(bus_err)?,
                    ));
                }
            }

            let mut group_stats = Vec::new();
            for (group, cursor) in groups {
                let pending = count(
                    &self.conn,
                    "SELECT COUNT(*) FROM pending WHERE topic = ?1 AND group_name = ?2",
                    params![topic.as_str(), group.as_str()],
                )
                .await?;
                let dead_letters = count(
                    &self.conn,
                    "SELECT COUNT(*) FROM dead_letters WHERE topic = ?1 AND group_name = ?2",
                    params![topic.as_str(), group.as_str()],
                )
                .await?;
                let lag = lag_in(&self.conn, &topic, &group).await?;
                group_stats.push(GroupStats {
                    group,
                    cursor: MessageId(cursor),
                    pending,
                    lag,
                    dead_letters,
                });
            }

            stats.push(TopicStats {
                topic,
                length,
                last_id: MessageId(next - 1),
                groups: group_stats,
            });
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Statement helpers (run on the connection or inside a transaction)
// ---------------------------------------------------------------------------

async fn count(conn: &Connection, sql: &str, params: impl IntoParams) -> Result<u64> {
    let mut rows = conn.query(sql, params).await.map_err(bus_err)?;
    match rows.next().await.map_err(bus_err)? {
        Some(row) => Ok(row.get::<i64>(0).map_err(bus_err)?.max(0) as u64),
        None => Ok(0),
    }
}

/// Next id to assign in `topic`, or `TopicNotFound`.
async fn next_id(conn: &Connection, topic: &str) -> Result<i64> {
    let mut rows = conn
        .query("SELECT next_id FROM topics WHERE name = ?1", params![topic])
        .await
        .map_err(bus_err)?;
    match rows.next().await.map_err(bus_err)? {
        Some(row) => row.get::<i64>(0).map_err(bus_err),
        None => Err(DigestError::TopicNotFound(topic.to_string())),
    }
}

/// Group cursor, or `TopicNotFound` / `GroupNotFound`.
async fn group_cursor(conn: &Connection, topic: &str, group: &str) -> Result<i64> {
    next_id(conn, topic).await?;
    let mut rows = conn
        .query(
            "SELECT last_delivered_id FROM consumer_groups WHERE topic = ?1 AND name = ?2",
            params![topic, group],
        )
        .await
        .map_err(bus_err)?;
    match rows.next().await.map_err(bus_err)? {
        Some(row) => row.get::<i64>(0).map_err(bus_err),
        None => Err(DigestError::GroupNotFound {
            topic: topic.to_string(),
            group: group.to_string(),
        }),
    }
}

async fn lag_in(conn: &Connection, topic: &str, group: &str) -> Result<u64> {
    let cursor = group_cursor(conn, topic, group).await?;
    let unread = count(
        conn,
        "SELECT COUNT(*) FROM messages WHERE topic = ?1 AND id > ?2",
        params![topic, cursor],
    )
    .await?;
    let pending = count(
        conn,
        "SELECT COUNT(*) FROM pending WHERE topic = ?1 AND group_name = ?2",
        params![topic, group],
    )
    .await?;
    Ok(unread + pending)
}

async fn append_in(conn: &Connection, topic: &str, json: &str) -> Result<MessageId> {
    let id = next_id(conn, topic).await?;
    conn.execute(
        "UPDATE topics SET next_id = ?2 WHERE name = ?1",
        params![topic, id + 1],
    )
    .await
    .map_err(bus_err)?;
    conn.execute(
        "INSERT INTO messages (topic, id, payload, appended_at) VALUES (?1, ?2, ?3, ?4)",
        params![topic, id, json, now_ms()],
    )
    .await
    .map_err(bus_err)?;
    Ok(MessageId(id))
}

async fn touch_consumer(
    conn: &Connection,
    topic: &str,
    group: &str,
    consumer: &str,
    last_delivered: Option<i64>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO consumers (topic, group_name, consumer, last_delivered_id, seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (topic, group_name, consumer) DO UPDATE SET
             last_delivered_id = MAX(last_delivered_id, excluded.last_delivered_id),
             seen_at = excluded.seen_at",
        params![topic, group, consumer, last_delivered.unwrap_or(0), now_ms()],
    )
    .await
    .map_err(bus_err)?;
    Ok(())
}

async fn claim_in(
    conn: &Connection,
    topic: &str,
    group: &str,
    consumer: &str,
    max_count: u32,
) -> Result<(Vec<Message>, Vec<DeadLetter>)> {
    let cursor = group_cursor(conn, topic, group).await?;

    let mut rows_read = Vec::new();
    {
        let mut rows = conn
            .query(
                "SELECT id, payload FROM messages WHERE topic = ?1 AND id > ?2
                 ORDER BY id LIMIT ?3",
                params![topic, cursor, max_count as i64],
            )
            .await
            .map_err(bus_err)?;
        while let Some(row) = rows.next().await.map_err(bus_err)? {
            rows_read.push((
                row.get::<i64>(0).map_err(bus_err)?,
                row.get::<String>(1).map_err(bus_err)?,
            ));
        }
    }

    let Some(last) = rows_read.last().map(|(id, _)| *id) else {
        return Ok((Vec::new(), Vec::new()));
    };

    let now = now_ms();
    let mut batch = Vec::with_capacity(rows_read.len());
    let mut dead = Vec::new();
    for (id, json) in rows_read {
        match Payload::from_json(&json) {
            Ok(payload) => {
                conn.execute(
                    "INSERT INTO pending (topic, group_name, message_id, consumer, delivered_at, delivery_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    params![topic, group, id, consumer, now],
                )
                .await
                .map_err(bus_err)?;
                batch.push(Message {
                    id: MessageId(id),
                    payload,
                });
            }
            Err(e) => {
                tracing::warn!(topic, group, %id, error = %e, "undecodable message");
                dead.push(bury_in(conn, topic, group, id, consumer, 0, &json, Payload::new()).await?);
            }
        }
    }
    conn.execute(
        "UPDATE consumer_groups SET last_delivered_id = ?3 WHERE topic = ?1 AND name = ?2",
        params![topic, group, last],
    )
    .await
    .map_err(bus_err)?;
    touch_consumer(conn, topic, group, consumer, Some(last)).await?;
    Ok((batch, dead))
}

/// Move a message into the dead letters of `group`, dropping its pending entry.
#[allow(clippy::too_many_arguments)]
async fn bury_in(
    conn: &Connection,
    topic: &str,
    group: &str,
    id: i64,
    consumer: &str,
    deliveries: u32,
    json: &str,
    payload: Payload,
) -> Result<DeadLetter> {
    let dead_at = Utc::now();
    conn.execute(
        "DELETE FROM pending WHERE topic = ?1 AND group_name = ?2 AND message_id = ?3",
        params![topic, group, id],
    )
    .await
    .map_err(bus_err)?;
    conn.execute(
        "INSERT OR IGNORE INTO dead_letters
             (topic, group_name, message_id, consumer, delivery_count, payload, dead_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![topic, group, id, consumer, deliveries, json, dead_at.to_rfc3339()],
    )
    .await
    .map_err(bus_err)?;
    Ok(DeadLetter {
        topic: topic.to_string(),
        group: group.to_string(),
        id: MessageId(id),
        consumer: consumer.to_string(),
        delivery_count: deliveries,
        payload,
        dead_at,
    })
}

async fn reclaim_in(
    conn: &Connection,
    topic: &str,
    group: &str,
    consumer: &str,
    min_idle: Duration,
    max_deliveries: u32,
) -> Result<(Vec<Message>, Vec<DeadLetter>)> {
    group_cursor(conn, topic, group).await?;
    let now = now_ms();
    let cutoff = now - min_idle.as_millis() as i64;

    let mut stalled = Vec::new();
    {
        let mut rows = conn
            .query(
                "SELECT p.message_id, p.consumer, p.delivery_count, m.payload
                 FROM pending p
                 JOIN messages m ON m.topic = p.topic AND m.id = p.message_id
                 WHERE p.topic = ?1 AND p.group_name = ?2 AND p.delivered_at <= ?3
                 ORDER BY p.message_id",
                params![topic, group, cutoff],
            )
            .await
            .map_err(bus_err)?;
        while let Some(row) = rows.next().await.map_err(bus_err)? {
            stalled.push((
                row.get::<i64>(0).map_err(bus_err)?,
                row.get::<String>(1).map_err(bus_err)?,
                row.get::<u32>(2).map_err(bus_err)?,
                row.get::<String>(3).map_err(bus_err)?,
            ));
        }
    }

    let mut reclaimed = Vec::new();
    let mut dead = Vec::new();
    for (id, owner, deliveries, json) in stalled {
        let payload = match Payload::from_json(&json) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic, group, %id, error = %e, "undecodable message");
                dead.push(bury_in(conn, topic, group, id, &owner, deliveries, &json, Payload::new()).await?);
                continue;
            }
        };
        if deliveries >= max_deliveries {
            dead.push(bury_in(conn, topic, group, id, &owner, deliveries, &json, payload).await?);
        } else {
            conn.execute(
                "UPDATE pending SET consumer = ?4, delivered_at = ?5, delivery_count = delivery_count + 1
                 WHERE topic = ?1 AND group_name = ?2 AND message_id = ?3",
                params![topic, group, id, consumer, now],
            )
            .await
            .map_err(bus_err)?;
            reclaimed.push(Message {
                id: MessageId(id),
                payload,
            });
        }
    }

    if !reclaimed.is_empty() {
        touch_consumer(conn, topic, group, consumer, None).await?;
    }
    Ok((reclaimed, dead))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use uuid::Uuid;

    const TOPIC: &str = "raw";
    const GROUP: &str = "ravedigest-analyzer";

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rd_bus_test_{}.db", Uuid::now_v7()))
    }

    async fn test_bus_with(options: BusOptions) -> StreamBus {
        let bus = StreamBus::open(&temp_path(), options).await.expect("open bus");
        bus.create_topic(TOPIC).await.unwrap();
        bus.create_group(TOPIC, GROUP, StartFrom::Beginning).await.unwrap();
        bus
    }

    async fn test_bus() -> StreamBus {
        test_bus_with(BusOptions::default()).await
    }

    fn article(n: u32) -> Payload {
        Payload::new()
            .with("title", format!("article {n}"))
            .with("n", n as i64)
    }

    #[derive(Default)]
    struct RecordingSink(StdMutex<Vec<DeadLetter>>);

    impl DeadLetterSink for RecordingSink {
        fn report(&self, letter: &DeadLetter) {
            self.0.lock().unwrap().push(letter.clone());
        }
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_path();
        let first = StreamBus::open(&tmp, BusOptions::default()).await.expect("first open");
        drop(first);
        let second = StreamBus::open(&tmp, BusOptions::default()).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 2);
        second.ping().await.expect("ping");
    }

    #[tokio::test]
    async fn append_to_unknown_topic_fails() {
        let bus = test_bus().await;
        let err = bus.append("nope", &article(1)).await.unwrap_err();
        assert!(matches!(err, DigestError::TopicNotFound(t) if t == "nope"));
    }

    #[tokio::test]
    async fn claim_from_unknown_group_fails() {
        let bus = test_bus().await;
        let err = bus
            .claim(TOPIC, "missing", "c1", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DigestError::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn ids_increase_and_survive_trim() {
        let bus = test_bus().await;
        let a = bus.append(TOPIC, &article(1)).await.unwrap();
        let b = bus.append(TOPIC, &article(2)).await.unwrap();
        assert!(b > a);

        bus.trim(TOPIC, TrimPolicy::MaxLen(0)).await.unwrap();
        assert_eq!(bus.topic_len(TOPIC).await.unwrap(), 0);
        let c = bus.append(TOPIC, &article(3)).await.unwrap();
        assert!(c > b);
    }

    #[tokio::test]
    async fn claim_delivers_in_order_and_tracks_pending() {
        let bus = test_bus().await;
        for n in 1..=5 {
            bus.append(TOPIC, &article(n)).await.unwrap();
        }

        let batch = bus.claim(TOPIC, GROUP, "c1", 3, Duration::ZERO).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(batch[0].payload.get_str("title"), Some("article 1"));

        let pending = bus.pending(TOPIC, GROUP).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|p| p.delivery_count == 1 && p.consumer == "c1"));

        let rest = bus.claim(TOPIC, GROUP, "c2", 10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].id, MessageId(4));
    }

    #[tokio::test]
    async fn empty_claim_blocks_until_timeout() {
        let bus = test_bus().await;
        let start = std::time::Instant::now();
        let batch = bus
            .claim(TOPIC, GROUP, "c1", 10, Duration::from_millis(150))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn blocked_claim_wakes_on_append() {
        let bus = Arc::new(test_bus().await);
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.claim(TOPIC, GROUP, "c1", 10, Duration::from_secs(10)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.append(TOPIC, &article(1)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("claim returned before its block timeout")
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_share_a_message() {
        let path = temp_path();
        let setup = StreamBus::open(&path, BusOptions::default()).await.unwrap();
        setup.create_topic(TOPIC).await.unwrap();
        setup.create_group(TOPIC, GROUP, StartFrom::Beginning).await.unwrap();
        for n in 0..40 {
            setup.append(TOPIC, &article(n)).await.unwrap();
        }

        let mut handles = Vec::new();
        for consumer in ["c1", "c2", "c3"] {
            let bus = StreamBus::open(&path, BusOptions::default()).await.unwrap();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let batch = bus.claim(TOPIC, GROUP, consumer, 3, Duration::ZERO).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    seen.extend(batch.into_iter().map(|m| m.id));
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        let mut total = 0;
        for handle in handles {
            let seen = handle.await.unwrap();
            total += seen.len();
            all.extend(seen);
        }
        assert_eq!(total, 40, "a message was delivered twice");
        assert_eq!(all.len(), 40);
        assert_eq!(setup.pending(TOPIC, GROUP).await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn double_acknowledge_is_noop() {
        let bus = test_bus().await;
        bus.append(TOPIC, &article(1)).await.unwrap();
        let batch = bus.claim(TOPIC, GROUP, "c1", 1, Duration::ZERO).await.unwrap();
        let id = batch[0].id;

        assert!(bus.acknowledge(TOPIC, GROUP, id).await.unwrap());
        assert!(!bus.acknowledge(TOPIC, GROUP, id).await.unwrap());
        assert!(bus.pending(TOPIC, GROUP).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaim_waits_for_min_idle_and_bumps_count_once() {
        let bus = test_bus().await;
        bus.append(TOPIC, &article(1)).await.unwrap();
        bus.claim(TOPIC, GROUP, "crashed", 1, Duration::ZERO).await.unwrap();

        let early = bus
            .reclaim_stalled(TOPIC, GROUP, "rescuer", Duration::from_millis(300))
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(350)).await;
        let reclaimed = bus
            .reclaim_stalled(TOPIC, GROUP, "rescuer", Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        let pending = bus.pending(TOPIC, GROUP).await.unwrap();
        assert_eq!(pending[0].delivery_count, 2);
        assert_eq!(pending[0].consumer, "rescuer");

        // delivery time was reset
        let again = bus
            .reclaim_stalled(TOPIC, GROUP, "rescuer", Duration::from_millis(300))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn non_finite_number_is_refused_at_append() {
        let bus = test_bus().await;
        let err = bus
            .append(TOPIC, &Payload::new().with("score", f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, DigestError::Validation { .. }));
        assert_eq!(bus.topic_len(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_message_does_not_stall_the_group() {
        let sink = Arc::new(RecordingSink::default());
        let bus = test_bus().await.with_sink(sink.clone());

        // written past the encoder, as an older build could have stored it
        append_in(&bus.conn, TOPIC, r#"{"score":null}"#).await.unwrap();
        bus.append(TOPIC, &article(2)).await.unwrap();

        let batch = bus.claim(TOPIC, GROUP, "c1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, MessageId(2));

        let reported = sink.0.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].id, MessageId(1));
        assert_eq!(reported[0].delivery_count, 0);

        let pending = bus.pending(TOPIC, GROUP).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(bus.dead_letters(TOPIC, GROUP).await.unwrap().len(), 1);

        let again = bus.claim(TOPIC, GROUP, "c1", 10, Duration::ZERO).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_pending_entry_is_dead_lettered_on_reclaim() {
        let sink = Arc::new(RecordingSink::default());
        let bus = test_bus().await.with_sink(sink.clone());
        bus.append(TOPIC, &article(1)).await.unwrap();
        bus.append(TOPIC, &article(2)).await.unwrap();
        bus.claim(TOPIC, GROUP, "c1", 10, Duration::ZERO).await.unwrap();

        bus.conn
            .execute(
                "UPDATE messages SET payload = ?2 WHERE topic = ?1 AND id = 1",
                params![TOPIC, r#"{"score":null}"#],
            )
            .await
            .unwrap();

        let reclaimed = bus
            .reclaim_stalled(TOPIC, GROUP, "c2", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, MessageId(2));
        assert_eq!(sink.0.lock().unwrap()[0].id, MessageId(1));
    }

    #[tokio::test]
    async fn dead_letter_reported_exactly_once() {
        let sink = Arc::new(RecordingSink::default());
        let bus = test_bus_with(BusOptions {
            max_deliveries: 2,
            ..BusOptions::default()
        })
        .await
        .with_sink(sink.clone());

        bus.append(TOPIC, &article(1)).await.unwrap();
        bus.claim(TOPIC, GROUP, "c1", 1, Duration::ZERO).await.unwrap();

        // count 1 -> 2
        let first = bus.reclaim_stalled(TOPIC, GROUP, "c1", Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        // count 2 reached the threshold
        let second = bus.reclaim_stalled(TOPIC, GROUP, "c1", Duration::ZERO).await.unwrap();
        assert!(second.is_empty());
        let third = bus.reclaim_stalled(TOPIC, GROUP, "c1", Duration::ZERO).await.unwrap();
        assert!(third.is_empty());

        let reported = sink.0.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].delivery_count, 2);
        assert_eq!(reported[0].payload.get_str("title"), Some("article 1"));

        assert!(bus.pending(TOPIC, GROUP).await.unwrap().is_empty());
        assert_eq!(bus.dead_letters(TOPIC, GROUP).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trim_keeps_pending_messages() {
        let bus = test_bus().await;
        for n in 1..=6 {
            bus.append(TOPIC, &article(n)).await.unwrap();
        }
        // 1 and 2 pending, 3 and 4 acknowledged
        let batch = bus.claim(TOPIC, GROUP, "c1", 4, Duration::ZERO).await.unwrap();
        bus.acknowledge(TOPIC, GROUP, batch[2].id).await.unwrap();
        bus.acknowledge(TOPIC, GROUP, batch[3].id).await.unwrap();

        let removed = bus.trim(TOPIC, TrimPolicy::MaxLen(2)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(bus.topic_len(TOPIC).await.unwrap(), 4);

        // pending messages are still reclaimable with their payload
        let reclaimed = bus.reclaim_stalled(TOPIC, GROUP, "c2", Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed.len(), 2);
    }

    #[tokio::test]
    async fn trim_by_age() {
        let bus = test_bus().await;
        bus.append(TOPIC, &article(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        bus.append(TOPIC, &article(2)).await.unwrap();

        let removed = bus
            .trim(TOPIC, TrimPolicy::MaxAge(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(bus.topic_len(TOPIC).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn append_once_skips_duplicates() {
        let bus = test_bus().await;
        let first = bus.append_once(TOPIC, "url-hash", &article(1)).await.unwrap();
        let second = bus.append_once(TOPIC, "url-hash", &article(1)).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(bus.topic_len(TOPIC).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lag_counts_unread_and_pending() {
        let bus = test_bus().await;
        for n in 1..=4 {
            bus.append(TOPIC, &article(n)).await.unwrap();
        }
        assert_eq!(bus.lag(TOPIC, GROUP).await.unwrap(), 4);

        let batch = bus.claim(TOPIC, GROUP, "c1", 2, Duration::ZERO).await.unwrap();
        assert_eq!(bus.lag(TOPIC, GROUP).await.unwrap(), 4);

        for m in &batch {
            bus.acknowledge(TOPIC, GROUP, m.id).await.unwrap();
        }
        assert_eq!(bus.lag(TOPIC, GROUP).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn latest_group_skips_history_and_create_is_idempotent() {
        let bus = test_bus().await;
        bus.append(TOPIC, &article(1)).await.unwrap();
        bus.create_group(TOPIC, "late", StartFrom::Latest).await.unwrap();
        assert_eq!(bus.lag(TOPIC, "late").await.unwrap(), 0);

        bus.claim(TOPIC, GROUP, "c1", 10, Duration::ZERO).await.unwrap();
        // recreating must not reset the cursor
        bus.create_group(TOPIC, GROUP, StartFrom::Beginning).await.unwrap();
        let again = bus.claim(TOPIC, GROUP, "c1", 10, Duration::ZERO).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn stats_cover_topics_and_groups() {
        let bus = test_bus().await;
        bus.create_topic("enriched").await.unwrap();
        bus.append(TOPIC, &article(1)).await.unwrap();
        bus.append(TOPIC, &article(2)).await.unwrap();
        bus.claim(TOPIC, GROUP, "c1", 1, Duration::ZERO).await.unwrap();

        let stats = bus.stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        let raw = stats.iter().find(|t| t.topic == TOPIC).unwrap();
        assert_eq!(raw.length, 2);
        assert_eq!(raw.last_id, MessageId(2));
        assert_eq!(raw.groups[0].pending, 1);
        assert_eq!(raw.groups[0].lag, 2);
    }
}
