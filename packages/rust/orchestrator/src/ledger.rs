//! Run history on libsql. Records are created at run start and finalized
//! exactly once.

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use ravedigest_shared::{DigestError, Result, RunOutcome, RunRecord, StageName};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id         TEXT PRIMARY KEY,
    started_at     TEXT NOT NULL,
    finished_at    TEXT,
    stage_reached  TEXT NOT NULL,
    outcome        TEXT,
    failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
"#;

fn db_err(e: libsql::Error) -> DigestError {
    DigestError::Bus(format!("run ledger: {e}"))
}

pub struct RunLedger {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl RunLedger {
    /// Open or create the ledger database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DigestError::io(parent, e))?;
            }
        }
        let db = libsql::Builder::new_local(path).build().await.map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        conn.execute_batch(SCHEMA).await.map_err(db_err)?;
        tracing::debug!(path = %path.display(), "run ledger opened");
        Ok(Self { db, conn })
    }

    /// Insert a new, unfinished run.
    pub async fn begin(&self) -> Result<RunRecord> {
        let record = RunRecord {
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
            finished_at: None,
            stage_reached: StageName::Collector,
            outcome: None,
            failure_reason: None,
        };
        self.conn
            .execute(
                "INSERT INTO runs (run_id, started_at, stage_reached) VALUES (?1, ?2, ?3)",
                params![
                    record.run_id.to_string(),
                    record.started_at.to_rfc3339(),
                    record.stage_reached.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(record)
    }

    /// Move an unfinished run's `stage_reached` forward.
    pub async fn advance(&self, run_id: Uuid, stage: StageName) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET stage_reached = ?2 WHERE run_id = ?1 AND finished_at IS NULL",
                params![run_id.to_string(), stage.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Finalize a run. Fails if the run is unknown or already finalized.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        stage_reached: StageName,
        outcome: RunOutcome,
        failure_reason: Option<&str>,
    ) -> Result<RunRecord> {
        let finished_at = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE runs
                 SET finished_at = ?2, stage_reached = ?3, outcome = ?4, failure_reason = ?5
                 WHERE run_id = ?1 AND finished_at IS NULL",
                params![
                    run_id.to_string(),
                    finished_at,
                    stage_reached.as_str(),
                    outcome.as_str(),
                    failure_reason
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(DigestError::validation(format!(
                "run {run_id} is unknown or already finalized"
            )));
        }
        self.get(run_id)
            .await?
            .ok_or_else(|| DigestError::Bus(format!("run {run_id} vanished after finalize")))
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, started_at, finished_at, stage_reached, outcome, failure_reason
                 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent runs first.
    pub async fn history(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, started_at, finished_at, stage_reached, outcome, failure_reason
                 FROM runs ORDER BY started_at DESC, run_id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(db_err)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &libsql::Row) -> Result<RunRecord> {
    let run_id: String = row.get(0).map_err(db_err)?;
    let started_at: String = row.get(1).map_err(db_err)?;
    let finished_at: Option<String> = row.get(2).ok();
    let stage_reached: String = row.get(3).map_err(db_err)?;
    let outcome: Option<String> = row.get(4).ok();
    let failure_reason: Option<String> = row.get(5).ok();

    Ok(RunRecord {
        run_id: run_id
            .parse()
            .map_err(|e| DigestError::validation(format!("run_id: {e}")))?,
        started_at: parse_ts(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
        stage_reached: stage_reached.parse()?,
        outcome: outcome.as_deref().map(str::parse).transpose()?,
        failure_reason,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DigestError::validation(format!("timestamp '{s}': {e}")))
}
