// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Persistent linear state machines. A machine is a named pipeline of
//! transitions; every transition outcome is persisted to an append-only
//! event log before the next transition begins, so a crashed run resumes by
//! re-invoking the transition of the last persisted event. Transitions must
//! therefore be deterministic and idempotent.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error as ThisError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::imageutil::ImageError;

/// Error taxonomy surfaced by transitions. Transient failures are retried up
/// to the transition's cap; aborts poison the run; cancellation leaves the
/// run resumable.
#[derive(Debug, ThisError)]
pub enum MachineError {
    #[error("transient error: {0:#}")]
    Transient(anyhow::Error),
    #[error("aborted: {0:#}")]
    Abort(anyhow::Error),
    #[error("cancelled")]
    Cancelled,
}

impl MachineError {
    /// CLI exit code: 1 for failures worth retrying, 2 for permanent ones.
    pub fn exit_code(&self) -> i32 {
        match self {
            MachineError::Transient(_) | MachineError::Cancelled => 1,
            MachineError::Abort(_) => 2,
        }
    }
}

/// Classify an error by the permanence of its typed class.
pub fn classify(e: anyhow::Error) -> MachineError {
    match e.downcast_ref::<ImageError>() {
        Some(image_err) if image_err.is_permanent() => MachineError::Abort(e),
        _ => MachineError::Transient(e),
    }
}

pub fn transient<E: Into<anyhow::Error>>(e: E) -> MachineError {
    MachineError::Transient(e.into())
}

pub fn abort<E: Into<anyhow::Error>>(e: E) -> MachineError {
    MachineError::Abort(e.into())
}

/// What a successful transition tells the runtime to do next.
#[derive(Debug)]
pub enum Step<A> {
    /// Persist the accumulated response and move to the next transition.
    Continue(A),
    /// The work is already durably complete; skip the remaining transitions
    /// and report the accumulated response as the final one.
    Handoff(A),
}

/// Context handed to every transition invocation.
#[derive(Clone)]
pub struct TransitionCtx {
    pub run_id: String,
    /// How many times this transition has already failed in this run.
    pub retry_count: u32,
    pub cancel: CancellationToken,
}

pub type TransitionFn<R, A> = Box<
    dyn Fn(TransitionCtx, Arc<R>, A) -> BoxFuture<'static, Result<Step<A>, MachineError>>
        + Send
        + Sync,
>;

pub struct Transition<R, A> {
    pub name: &'static str,
    pub retry_cap: u32,
    pub run: TransitionFn<R, A>,
}

impl<R, A> Transition<R, A> {
    pub fn new(name: &'static str, retry_cap: u32, run: TransitionFn<R, A>) -> Self {
        Self {
            name,
            retry_cap,
            run,
        }
    }
}

/// Where a resumed run picks up.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunCursor {
    pub index: usize,
    pub acc_json: Option<String>,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub machine: String,
    pub request: String,
}

#[derive(Debug, Clone)]
pub struct RunStatus {
    pub run_id: String,
    pub machine: String,
    pub status: String,
    pub updated_at: String,
    pub last_transition: Option<String>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
}

/// Append-only event log shared by every machine, backed by its own
/// database file under the state directory.
pub struct EventLog {
    conn: StdMutex<Connection>,
}

impl EventLog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = normal;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to configure event log")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 machine TEXT NOT NULL,
                 request TEXT NOT NULL,
                 status TEXT NOT NULL DEFAULT 'running'
                     CHECK (status IN ('running', 'done', 'aborted')),
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 transition_index INTEGER NOT NULL,
                 transition TEXT NOT NULL,
                 outcome TEXT NOT NULL
                     CHECK (outcome IN ('continue', 'handoff', 'retry', 'abort', 'cancel')),
                 payload TEXT,
                 error TEXT,
                 created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS events_by_run ON events (run_id, id);",
        )
        .context("Failed to create event log schema")?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Find or create the run for this identity. A terminal run is reset to
    /// a fresh attempt; a running one yields the resume cursor.
    pub fn load_or_create(
        &self,
        run_id: &str,
        machine: &str,
        request_json: &str,
    ) -> Result<RunCursor> {
        let conn = self.conn();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()
            .context("Failed to look up run")?;

        match status.as_deref() {
            None => {
                conn.execute(
                    "INSERT INTO runs (run_id, machine, request, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'running', datetime('now'), datetime('now'))",
                    params![run_id, machine, request_json],
                )
                .context("Failed to create run")?;
                Ok(RunCursor::default())
            }
            Some("running") => Self::cursor_from_events(&conn, run_id),
            Some(_) => {
                // The durable completion evidence lives in the metadata
                // store; a resubmission just starts a fresh attempt whose
                // early transitions hand off if nothing is left to do.
                conn.execute(
                    "UPDATE runs SET status = 'running', request = ?2,
                            updated_at = datetime('now')
                     WHERE run_id = ?1",
                    params![run_id, request_json],
                )
                .context("Failed to reset run")?;
                conn.execute("DELETE FROM events WHERE run_id = ?1", params![run_id])
                    .context("Failed to clear old events")?;
                Ok(RunCursor::default())
            }
        }
    }

    fn cursor_from_events(conn: &Connection, run_id: &str) -> Result<RunCursor> {
        let mut stmt = conn
            .prepare(
                "SELECT transition_index, outcome, payload FROM events
                 WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare event scan")?;
        let events = stmt
            .query_map(params![run_id], |r| {
                Ok((
                    r.get::<_, i64>(0)? as usize,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to scan events")?;

        let mut last_continue: Option<(usize, Option<String>)> = None;
        let mut prev_payload: Option<String> = None;
        let mut pending_retry: Option<(usize, u32)> = None;
        for (index, outcome, payload) in events {
            match outcome.as_str() {
                "continue" => {
                    prev_payload = last_continue.take().and_then(|(_, payload)| payload);
                    last_continue = Some((index, payload));
                    pending_retry = None;
                }
                "retry" => {
                    let count = match pending_retry {
                        Some((prev_index, count)) if prev_index == index => count + 1,
                        _ => 1,
                    };
                    pending_retry = Some((index, count));
                }
                // A cancelled or terminal event changes nothing about where
                // the next attempt resumes.
                _ => {}
            }
        }

        let in_flight_retry = match pending_retry {
            Some((index, retries))
                if last_continue
                    .as_ref()
                    .map_or(true, |(continue_index, _)| index > *continue_index) =>
            {
                Some((index, retries))
            }
            _ => None,
        };
        let cursor = if let Some((index, retries)) = in_flight_retry {
            RunCursor {
                index,
                acc_json: last_continue.and_then(|(_, payload)| payload),
                retries,
            }
        } else if let Some((index, _)) = last_continue {
            // Re-invoke the transition of the last persisted event with the
            // accumulated response it originally saw.
            RunCursor {
                index,
                acc_json: prev_payload,
                retries: 0,
            }
        } else {
            RunCursor::default()
        };
        Ok(cursor)
    }

    fn record(
        &self,
        run_id: &str,
        index: usize,
        transition: &str,
        outcome: &str,
        payload: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO events
                 (run_id, transition_index, transition, outcome, payload, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            params![run_id, index as i64, transition, outcome, payload, error],
        )
        .context("Failed to append event")?;
        conn.execute(
            "UPDATE runs SET updated_at = datetime('now') WHERE run_id = ?1",
            params![run_id],
        )
        .context("Failed to touch run")?;
        Ok(())
    }

    pub fn record_continue(
        &self,
        run_id: &str,
        index: usize,
        transition: &str,
        payload: &str,
    ) -> Result<()> {
        self.record(run_id, index, transition, "continue", Some(payload), None)
    }

    pub fn record_handoff(
        &self,
        run_id: &str,
        index: usize,
        transition: &str,
        payload: &str,
    ) -> Result<()> {
        self.record(run_id, index, transition, "handoff", Some(payload), None)?;
        self.finish_run(run_id, "done")
    }

    pub fn record_retry(
        &self,
        run_id: &str,
        index: usize,
        transition: &str,
        error: &str,
    ) -> Result<()> {
        self.record(run_id, index, transition, "retry", None, Some(error))
    }

    pub fn record_abort(
        &self,
        run_id: &str,
        index: usize,
        transition: &str,
        error: &str,
    ) -> Result<()> {
        self.record(run_id, index, transition, "abort", None, Some(error))?;
        self.finish_run(run_id, "aborted")
    }

    pub fn record_cancel(&self, run_id: &str, index: usize, transition: &str) -> Result<()> {
        self.record(run_id, index, transition, "cancel", None, None)
    }

    pub fn finish_run(&self, run_id: &str, status: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE runs SET status = ?2, updated_at = datetime('now')
                 WHERE run_id = ?1",
                params![run_id, status],
            )
            .context("Failed to finish run")?;
        Ok(())
    }

    /// Every non-terminal run, for startup resume.
    pub fn pending_runs(&self) -> Result<Vec<RunRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, machine, request FROM runs
             WHERE status = 'running' ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(RunRow {
                    run_id: r.get(0)?,
                    machine: r.get(1)?,
                    request: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list pending runs")?;
        Ok(rows)
    }

    pub fn run_status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let conn = self.conn();
        let base = conn
            .query_row(
                "SELECT run_id, machine, status, updated_at FROM runs WHERE run_id = ?1",
                params![run_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to look up run status")?;
        let (run_id, machine, status, updated_at) = match base {
            Some(base) => base,
            None => return Ok(None),
        };
        let last = conn
            .query_row(
                "SELECT transition, outcome, error FROM events
                 WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                params![run_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to look up last event")?;
        let (last_transition, last_outcome, last_error) = match last {
            Some((transition, outcome, error)) => (Some(transition), Some(outcome), error),
            None => (None, None, None),
        };
        Ok(Some(RunStatus {
            run_id,
            machine,
            status,
            updated_at,
            last_transition,
            last_outcome,
            last_error,
        }))
    }
}

/// A registered machine: a pipeline of transitions plus a bounded slot pool.
pub struct StateMachine<R, A> {
    name: &'static str,
    transitions: Vec<Transition<R, A>>,
    log: Arc<EventLog>,
    slots: Arc<Semaphore>,
}

impl<R, A> StateMachine<R, A>
where
    R: Serialize + Send + Sync + 'static,
    A: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    pub fn new(
        name: &'static str,
        transitions: Vec<Transition<R, A>>,
        log: Arc<EventLog>,
        concurrency: usize,
    ) -> Self {
        Self {
            name,
            transitions,
            log,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn run_id_for(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    /// Drive a request through the pipeline. Identical keys converge on the
    /// same persisted run; excess submissions wait on the slot pool.
    pub async fn submit(
        &self,
        key: &str,
        request: R,
        cancel: &CancellationToken,
    ) -> Result<A, MachineError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|e| transient(anyhow::anyhow!("machine queue closed: {}", e)))?;

        let run_id = self.run_id_for(key);
        let request_json = serde_json::to_string(&request).map_err(transient)?;
        let request = Arc::new(request);
        let cursor = self
            .log
            .load_or_create(&run_id, self.name, &request_json)
            .map_err(transient)?;

        let mut index = cursor.index;
        let mut retries = cursor.retries;
        let mut acc: A = match &cursor.acc_json {
            Some(json) => serde_json::from_str(json).map_err(transient)?,
            None => A::default(),
        };
        if index > 0 || retries > 0 {
            info!(
                "Resuming {} at transition {} (retry count {})",
                run_id, index, retries
            );
        }

        while index < self.transitions.len() {
            let transition = &self.transitions[index];
            if cancel.is_cancelled() {
                self.log
                    .record_cancel(&run_id, index, transition.name)
                    .map_err(transient)?;
                return Err(MachineError::Cancelled);
            }

            let ctx = TransitionCtx {
                run_id: run_id.clone(),
                retry_count: retries,
                cancel: cancel.clone(),
            };
            match (transition.run)(ctx, request.clone(), acc.clone()).await {
                Ok(Step::Continue(next)) => {
                    let payload = serde_json::to_string(&next).map_err(transient)?;
                    self.log
                        .record_continue(&run_id, index, transition.name, &payload)
                        .map_err(transient)?;
                    acc = next;
                    index += 1;
                    retries = 0;
                }
                Ok(Step::Handoff(next)) => {
                    let payload = serde_json::to_string(&next).map_err(transient)?;
                    self.log
                        .record_handoff(&run_id, index, transition.name, &payload)
                        .map_err(transient)?;
                    info!("{} handed off at {}", run_id, transition.name);
                    return Ok(next);
                }
                Err(MachineError::Transient(e)) => {
                    retries += 1;
                    warn!(
                        "{} transition {} failed (attempt {} of {}): {:#}",
                        run_id, transition.name, retries, transition.retry_cap, e
                    );
                    self.log
                        .record_retry(&run_id, index, transition.name, &format!("{:#}", e))
                        .map_err(transient)?;
                    if retries >= transition.retry_cap {
                        let err = e.context(format!(
                            "transition {} exceeded its retry cap of {}",
                            transition.name, transition.retry_cap
                        ));
                        self.log
                            .record_abort(&run_id, index, transition.name, &format!("{:#}", err))
                            .map_err(transient)?;
                        return Err(MachineError::Abort(err));
                    }
                    let backoff = Duration::from_millis(100 * u64::from(retries));
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.log
                                .record_cancel(&run_id, index, transition.name)
                                .map_err(transient)?;
                            return Err(MachineError::Cancelled);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(MachineError::Abort(e)) => {
                    self.log
                        .record_abort(&run_id, index, transition.name, &format!("{:#}", e))
                        .map_err(transient)?;
                    return Err(MachineError::Abort(e));
                }
                Err(MachineError::Cancelled) => {
                    self.log
                        .record_cancel(&run_id, index, transition.name)
                        .map_err(transient)?;
                    return Err(MachineError::Cancelled);
                }
            }
        }

        self.log.finish_run(&run_id, "done").map_err(transient)?;
        Ok(acc)
    }
}

/// Wrap a future with a deadline; overruns surface as transient errors so
/// the retry budget applies.
pub async fn with_deadline<T>(
    what: &str,
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, MachineError>>,
) -> Result<T, MachineError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(transient(anyhow::anyhow!(
            "{} timed out after {:?}",
            what,
            deadline
        ))),
    }
}
