#![forbid(unsafe_code)]

use crate::error::StoreError;
use crate::metadata::{COLLECTION_JOBS, FindAndModify, JobDoc, MetadataStore, RunEnd, RunRecord};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xt_core::events::{EV_METRICS, LogEvent};
use xt_core::status::{JobStatus, RunStatus};
use xt_core::time::{now_ms, ts_ms_to_rfc3339};

const DB_FILE: &str = "xt_metadata.db";
const GLOBAL_SCOPE: &str = "";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed metadata store.
///
/// Several stores (one per controller) may share the same database file;
/// every write runs in an `IMMEDIATE` transaction so read-modify-write cycles
/// are serialized across connections.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let conn = Connection::open(storage_dir.join(DB_FILE))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        install_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            storage_dir,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn write_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn modify_job<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobDoc) -> T,
    ) -> Result<T, StoreError> {
        self.write_tx(|tx| {
            let mut job = load_job_tx(tx, job_id)?;
            let out = f(&mut job);
            save_doc_tx(tx, COLLECTION_JOBS, job_id, &serde_json::to_value(&job)?)?;
            Ok(out)
        })
    }

    fn modify_run(
        &self,
        ws: &str,
        run_name: &str,
        f: impl FnOnce(&mut RunRecord),
    ) -> Result<(), StoreError> {
        self.write_tx(|tx| {
            let mut run = load_run_tx(tx, ws, run_name)?.ok_or_else(|| unknown_run(ws, run_name))?;
            f(&mut run);
            save_run_tx(tx, &run)
        })
    }
}

impl MetadataStore for SqliteStore {
    fn next_job_id(&self) -> Result<i64, StoreError> {
        self.write_tx(|tx| next_counter_tx(tx, GLOBAL_SCOPE, "job"))
    }

    fn next_run_id(&self, ws: &str) -> Result<i64, StoreError> {
        self.write_tx(|tx| next_counter_tx(tx, ws, "run"))
    }

    fn next_child_id(&self, ws: &str, parent: &str) -> Result<i64, StoreError> {
        self.write_tx(|tx| next_counter_tx(tx, ws, &format!("child:{parent}")))
    }

    fn next_end_id(&self, ws: &str) -> Result<i64, StoreError> {
        self.write_tx(|tx| next_counter_tx(tx, ws, "end_id"))
    }

    fn find_and_modify(&self, request: &FindAndModify) -> Result<Option<JsonValue>, StoreError> {
        self.write_tx(|tx| {
            let mut doc = match load_doc_tx(tx, &request.collection, &request.key)? {
                Some(doc) => doc,
                None if request.upsert => JsonValue::Object(JsonMap::new()),
                None => return Ok(None),
            };
            let before = doc.clone();

            if let Some(elem_match) = &request.elem_match {
                let Some(items) = doc
                    .get_mut(&elem_match.array)
                    .and_then(JsonValue::as_array_mut)
                else {
                    return Ok(None);
                };
                let Some(element) = items.iter_mut().find(|e| elem_match.matches(e)) else {
                    return Ok(None);
                };
                let Some(fields) = element.as_object_mut() else {
                    return Err(StoreError::InvalidInput(format!(
                        "{}.{} holds a non-object element",
                        request.collection, elem_match.array
                    )));
                };
                for (k, v) in &request.set_elem {
                    fields.insert(k.clone(), v.clone());
                }
            }
            for (path, v) in &request.set_doc {
                set_path(&mut doc, path, v.clone());
            }

            save_doc_tx(tx, &request.collection, &request.key, &doc)?;
            Ok(Some(if request.return_new { doc } else { before }))
        })
    }

    fn get_document(&self, collection: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let conn = self.conn.lock();
        read_doc(&conn, collection, key)
    }

    fn create_job(&self, job: &JobDoc) -> Result<(), StoreError> {
        let doc = serde_json::to_value(job)?;
        self.write_tx(|tx| {
            if load_doc_tx(tx, COLLECTION_JOBS, &job.job_id)?.is_some() {
                return Err(StoreError::InvalidInput(format!(
                    "job {} already exists",
                    job.job_id
                )));
            }
            save_doc_tx(tx, COLLECTION_JOBS, &job.job_id, &doc)
        })
    }

    fn get_job(&self, job_id: &str) -> Result<Option<JobDoc>, StoreError> {
        match self.get_document(COLLECTION_JOBS, job_id)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    fn update_job(
        &self,
        job_id: &str,
        set_doc: &JsonMap<String, JsonValue>,
    ) -> Result<(), StoreError> {
        self.write_tx(|tx| {
            let mut doc = load_doc_tx(tx, COLLECTION_JOBS, job_id)?
                .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
            for (path, v) in set_doc {
                set_path(&mut doc, path, v.clone());
            }
            let _: JobDoc = serde_json::from_value(doc.clone())?;
            save_doc_tx(tx, COLLECTION_JOBS, job_id, &doc)
        })
    }

    fn job_run_start(&self, job_id: &str) -> Result<(), StoreError> {
        self.modify_job(job_id, |job| job.running_runs += 1)
    }

    fn job_run_exit(&self, job_id: &str, exit_code: i32) -> Result<(), StoreError> {
        self.modify_job(job_id, |job| {
            job.running_runs = (job.running_runs - 1).max(0);
            job.completed_runs += 1;
            if exit_code != 0 {
                job.error_runs += 1;
            }
        })
    }

    fn job_node_start(&self, job_id: &str) -> Result<(), StoreError> {
        self.modify_job(job_id, |job| {
            job.running_nodes += 1;
            job.job_status = JobStatus::Running;
        })
    }

    fn job_node_exit(&self, job_id: &str) -> Result<JobStatus, StoreError> {
        self.modify_job(job_id, |job| {
            job.running_nodes = (job.running_nodes - 1).max(0);
            if job.running_nodes == 0 {
                job.job_status = JobStatus::Completed;
            }
            job.job_status
        })
    }

    fn create_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.write_tx(|tx| {
            if load_run_tx(tx, &run.ws, &run.run_name)?.is_some() {
                return Err(StoreError::RunExists {
                    ws: run.ws.clone(),
                    run_name: run.run_name.clone(),
                });
            }
            save_run_tx(tx, run)
        })
    }

    fn get_run(&self, ws: &str, run_name: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.conn.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc_json FROM runs WHERE ws=?1 AND run_name=?2",
                params![ws, run_name],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(StoreError::from))
            .transpose()
    }

    fn update_run(
        &self,
        ws: &str,
        run_name: &str,
        set_doc: &JsonMap<String, JsonValue>,
    ) -> Result<(), StoreError> {
        self.write_tx(|tx| {
            let run = load_run_tx(tx, ws, run_name)?.ok_or_else(|| unknown_run(ws, run_name))?;
            let mut doc = serde_json::to_value(&run)?;
            for (path, v) in set_doc {
                set_path(&mut doc, path, v.clone());
            }
            let updated: RunRecord = serde_json::from_value(doc)?;
            save_run_tx(tx, &updated)
        })
    }

    fn add_run_event(&self, ws: &str, run_name: &str, event: &LogEvent) -> Result<(), StoreError> {
        let data_json = serde_json::to_string(&event.data)?;
        self.write_tx(|tx| {
            tx.execute(
                "INSERT INTO run_events(ws, run_name, time, event, data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ws, run_name, event.time, event.event, data_json],
            )?;
            if event.is(EV_METRICS) {
                if let Some(mut run) = load_run_tx(tx, ws, run_name)? {
                    let before = run.metric_names.len();
                    for name in event.data.keys() {
                        if !run.metric_names.iter().any(|n| n == name) {
                            run.metric_names.push(name.clone());
                        }
                    }
                    if run.metric_names.len() != before {
                        save_run_tx(tx, &run)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn run_events(&self, ws: &str, run_name: &str) -> Result<Vec<LogEvent>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, event, data_json FROM run_events WHERE ws=?1 AND run_name=?2 ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![ws, run_name])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data_json: String = row.get(2)?;
            out.push(LogEvent {
                time: row.get(0)?,
                event: row.get(1)?,
                data: serde_json::from_str(&data_json)?,
            });
        }
        Ok(out)
    }

    fn update_run_at_end(&self, ws: &str, run_name: &str, end: &RunEnd) -> Result<i64, StoreError> {
        self.write_tx(|tx| {
            let mut run = load_run_tx(tx, ws, run_name)?.ok_or_else(|| unknown_run(ws, run_name))?;
            let end_id = next_counter_tx(tx, ws, "end_id")?;
            run.status = end.status;
            run.exit_code = end.exit_code;
            run.restarts = end.restarts;
            run.end_ms = Some(end.end_ms);
            run.end_time = Some(ts_ms_to_rfc3339(end.end_ms));
            if run.run_duration_s.is_none() {
                run.run_duration_s = run.start_ms.map(|s| (end.end_ms - s) as f64 / 1000.0);
            }
            run.hparams = end.hparams.clone();
            run.metrics = end.metrics.clone();
            run.end_id = Some(end_id);
            save_run_tx(tx, &run)?;
            Ok(end_id)
        })
    }

    fn run_start(&self, ws: &str, run_name: &str) -> Result<(), StoreError> {
        let now = now_ms();
        self.modify_run(ws, run_name, |run| {
            run.status = RunStatus::Running;
            run.start_ms = Some(now);
            run.start_time = Some(ts_ms_to_rfc3339(now));
            run.queue_duration_s = Some((now - run.create_ms).max(0) as f64 / 1000.0);
        })
    }

    fn run_exit(&self, ws: &str, run_name: &str) -> Result<(), StoreError> {
        let now = now_ms();
        self.modify_run(ws, run_name, |run| {
            if let Some(start) = run.start_ms {
                run.run_duration_s = Some((now - start).max(0) as f64 / 1000.0);
            }
        })
    }

    fn completed_runs(
        &self,
        ws: &str,
        job_id: &str,
        min_end_id: i64,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT doc_json FROM runs
            WHERE ws=?1 AND job_id=?2 AND end_id IS NOT NULL AND end_id > ?3
            ORDER BY end_id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![ws, job_id, min_end_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let doc: String = row.get(0)?;
            out.push(serde_json::from_str(&doc)?);
        }
        Ok(out)
    }
}

fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS counters (
          scope TEXT NOT NULL,
          name TEXT NOT NULL,
          value INTEGER NOT NULL,
          PRIMARY KEY(scope, name)
        );

        CREATE TABLE IF NOT EXISTS documents (
          collection TEXT NOT NULL,
          key TEXT NOT NULL,
          doc_json TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          PRIMARY KEY(collection, key)
        );

        CREATE TABLE IF NOT EXISTS runs (
          ws TEXT NOT NULL,
          run_name TEXT NOT NULL,
          job_id TEXT,
          status TEXT NOT NULL,
          end_id INTEGER,
          doc_json TEXT NOT NULL,
          PRIMARY KEY(ws, run_name)
        );
        CREATE INDEX IF NOT EXISTS runs_by_job_end ON runs(ws, job_id, end_id);

        CREATE TABLE IF NOT EXISTS run_events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          ws TEXT NOT NULL,
          run_name TEXT NOT NULL,
          time TEXT NOT NULL,
          event TEXT NOT NULL,
          data_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS run_events_by_run ON run_events(ws, run_name, seq);
        "#,
    )?;
    Ok(())
}

fn next_counter_tx(tx: &Transaction<'_>, scope: &str, name: &str) -> Result<i64, StoreError> {
    let current: i64 = tx
        .query_row(
            "SELECT value FROM counters WHERE scope=?1 AND name=?2",
            params![scope, name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let next = current + 1;
    tx.execute(
        r#"
        INSERT INTO counters(scope, name, value) VALUES (?1, ?2, ?3)
        ON CONFLICT(scope, name) DO UPDATE SET value=excluded.value
        "#,
        params![scope, name, next],
    )?;
    Ok(next)
}

fn read_doc(conn: &Connection, collection: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT doc_json FROM documents WHERE collection=?1 AND key=?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
        .transpose()
}

fn load_doc_tx(
    tx: &Transaction<'_>,
    collection: &str,
    key: &str,
) -> Result<Option<JsonValue>, StoreError> {
    read_doc(tx, collection, key)
}

fn save_doc_tx(
    tx: &Transaction<'_>,
    collection: &str,
    key: &str,
    doc: &JsonValue,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO documents(collection, key, doc_json, updated_at_ms) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(collection, key) DO UPDATE SET doc_json=excluded.doc_json, updated_at_ms=excluded.updated_at_ms
        "#,
        params![collection, key, serde_json::to_string(doc)?, now_ms()],
    )?;
    Ok(())
}

fn load_job_tx(tx: &Transaction<'_>, job_id: &str) -> Result<JobDoc, StoreError> {
    let doc = load_doc_tx(tx, COLLECTION_JOBS, job_id)?
        .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
    Ok(serde_json::from_value(doc)?)
}

fn load_run_tx(
    tx: &Transaction<'_>,
    ws: &str,
    run_name: &str,
) -> Result<Option<RunRecord>, StoreError> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT doc_json FROM runs WHERE ws=?1 AND run_name=?2",
            params![ws, run_name],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
        .transpose()
}

fn save_run_tx(tx: &Transaction<'_>, run: &RunRecord) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO runs(ws, run_name, job_id, status, end_id, doc_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(ws, run_name) DO UPDATE SET
          job_id=excluded.job_id, status=excluded.status, end_id=excluded.end_id, doc_json=excluded.doc_json
        "#,
        params![
            run.ws,
            run.run_name,
            run.job_id,
            run.status.as_str(),
            run.end_id,
            serde_json::to_string(run)?,
        ],
    )?;
    Ok(())
}

fn unknown_run(ws: &str, run_name: &str) -> StoreError {
    StoreError::UnknownRun {
        ws: ws.to_string(),
        run_name: run_name.to_string(),
    }
}

/// Set a dotted path inside a JSON object, creating intermediate objects.
fn set_path(doc: &mut JsonValue, path: &str, value: JsonValue) {
    let mut cur = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !cur.is_object() {
            *cur = JsonValue::Object(JsonMap::new());
        }
        let Some(fields) = cur.as_object_mut() else {
            return;
        };
        if parts.peek().is_none() {
            fields.insert(part.to_string(), value);
            return;
        }
        cur = fields
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut doc = json!({ "a": 1 });
        set_path(&mut doc, "svc.node0.port", json!(18861));
        set_path(&mut doc, "a", json!(2));
        assert_eq!(doc, json!({ "a": 2, "svc": { "node0": { "port": 18861 } } }));
    }
}
