use std::{collections::HashMap, future::Future, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _},
    net::TcpStream,
    sync::watch,
    task::JoinSet,
    time::Instant,
};
use tracing::Instrument as _;

use crate::{
    config::{ReplayConfig, validate_speed},
    record::ReplayLogEntry,
    record_log::RecordLog,
    sessions::{LoadedSessions, ReplayRecord, Session},
    sync::{self, SyncStatus, SyncTracker},
};

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how fast to replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOptions {
    pub target_host: String,
    pub target_port: u16,
    speed: f64,
    sync_timeout: Duration,
}

impl ReplayOptions {
    /// Fails for a speed that is not a finite number above zero.
    pub fn new(target_host: impl Into<String>, target_port: u16, speed: f64) -> anyhow::Result<Self> {
        validate_speed(speed)?;
        Ok(Self {
            target_host: target_host.into(),
            target_port,
            speed,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        })
    }

    pub fn from_config(config: &ReplayConfig) -> anyhow::Result<Self> {
        Ok(
            Self::new(config.target_host.clone(), config.target_port, config.speed)?
                .with_sync_timeout(Duration::from_millis(config.sync_timeout_ms)),
        )
    }

    /// Bounds each wait for the server after a send. A session whose wait
    /// runs out is aborted.
    pub fn with_sync_timeout(mut self, sync_timeout: Duration) -> Self {
        self.sync_timeout = sync_timeout;
        self
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }
}

/// Aggregate counts for one replay run. `skipped` includes log lines the
/// loader could not use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub sessions: usize,
    pub sent: u64,
    pub skipped: u64,
    pub aborted_sessions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SessionOutcome {
    sent: u64,
    skipped: u64,
    aborted: bool,
}

impl SessionOutcome {
    fn abort(&mut self, unsent: usize) {
        self.skipped += unsent as u64;
        self.aborted = true;
    }
}

/// Offset from replay start at which a record captured at `capture_time`
/// is due, given the global `origin`. Saturates at `Duration::MAX`.
pub fn scheduled_offset(capture_time: DateTime<Utc>, origin: DateTime<Utc>, speed: f64) -> Duration {
    let elapsed = (capture_time - origin).to_std().unwrap_or(Duration::ZERO);
    Duration::try_from_secs_f64(elapsed.as_secs_f64() / speed).unwrap_or(Duration::MAX)
}

/// `None` when the offset lies beyond what the clock can represent; such a
/// record never comes due.
fn due_at(
    start: Instant,
    capture_time: DateTime<Utc>,
    origin: DateTime<Utc>,
    speed: f64,
) -> Option<Instant> {
    start.checked_add(scheduled_offset(capture_time, origin, speed))
}

pub async fn replay(loaded: &LoadedSessions, options: &ReplayOptions, log: &RecordLog) -> ReplaySummary {
    replay_until(loaded, options, log, std::future::pending()).await
}

/// Replays every session concurrently until all finish or `shutdown`
/// resolves. Sessions stop between records, never inside a payload write.
pub async fn replay_until(
    loaded: &LoadedSessions,
    options: &ReplayOptions,
    log: &RecordLog,
    shutdown: impl Future<Output = ()>,
) -> ReplaySummary {
    let mut summary = ReplaySummary {
        sessions: loaded.sessions.len(),
        skipped: loaded.skipped as u64,
        ..ReplaySummary::default()
    };
    let Some(origin) = loaded.origin() else {
        tracing::info!("no client -> server records to replay");
        return summary;
    };

    tracing::info!(
        sessions = loaded.sessions.len(),
        records = loaded.record_count(),
        target = %format!("{}:{}", options.target_host, options.target_port),
        speed = options.speed,
        "starting replay"
    );

    let start = Instant::now();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    let mut task_records = HashMap::new();
    for session in loaded.sessions.values() {
        let span = tracing::info_span!("session", peer = %session.peer());
        let handle = tasks.spawn(
            replay_session(
                session.clone(),
                origin,
                start,
                options.clone(),
                log.clone(),
                cancel_rx.clone(),
            )
            .instrument(span),
        );
        task_records.insert(handle.id(), session.records().len());
    }

    tokio::pin!(shutdown);
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok(outcome)) => {
                    summary.sent += outcome.sent;
                    summary.skipped += outcome.skipped;
                    if outcome.aborted {
                        summary.aborted_sessions += 1;
                    }
                }
                Some(Err(err)) => {
                    let unsent = task_records.get(&err.id()).copied().unwrap_or_default();
                    summary.skipped += unsent as u64;
                    summary.aborted_sessions += 1;
                    tracing::warn!(unsent, "session task failed: {err}");
                }
            },
            _ = &mut shutdown, if !interrupted => {
                interrupted = true;
                let _ = cancel_tx.send(true);
                tracing::info!("replay interrupted; stopping sessions");
            }
        }
    }

    tracing::info!(
        sessions = summary.sessions,
        sent = summary.sent,
        skipped = summary.skipped,
        aborted = summary.aborted_sessions,
        "replay finished"
    );
    summary
}

async fn replay_session(
    session: Session,
    origin: DateTime<Utc>,
    start: Instant,
    options: ReplayOptions,
    log: RecordLog,
    mut cancel: watch::Receiver<bool>,
) -> SessionOutcome {
    let records = session.records();
    let mut outcome = SessionOutcome::default();

    let Some(connect_at) = due_at(start, session.first_capture_time(), origin, options.speed) else {
        tracing::warn!("session starts beyond the schedulable range; skipping session");
        outcome.abort(records.len());
        return outcome;
    };
    if !sleep_until_or_cancel(connect_at, &mut cancel).await {
        outcome.abort(records.len());
        return outcome;
    }

    let target = (options.target_host.as_str(), options.target_port);
    let stream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(
                target = %format!("{}:{}", options.target_host, options.target_port),
                "connect failed; skipping session: {err}"
            );
            outcome.abort(records.len());
            return outcome;
        }
    };
    let _ = stream.set_nodelay(true);
    tracing::info!(records = records.len(), "session connected");
    let (mut reader, mut writer) = stream.into_split();
    let mut tracker = SyncTracker::default();

    for (index, record) in records.iter().enumerate() {
        let Some(due) = due_at(start, record.capture_time, origin, options.speed) else {
            tracing::warn!(
                line = record.line,
                "record is due beyond the schedulable range; aborting session"
            );
            outcome.abort(records.len() - index);
            break;
        };
        if !sleep_until_or_cancel(due, &mut cancel).await {
            outcome.abort(records.len() - index);
            break;
        }

        let payload = match hex::decode(&record.raw_hex) {
            Ok(payload) if !payload.is_empty() => payload,
            Ok(_) => {
                tracing::warn!(line = record.line, "skipping record: empty payload");
                outcome.skipped += 1;
                continue;
            }
            Err(err) => {
                tracing::warn!(line = record.line, "skipping record: bad hex ({err})");
                outcome.skipped += 1;
                continue;
            }
        };

        let replayed_at = Utc::now();
        if let Err(err) = send(&mut writer, &payload).await {
            tracing::warn!(line = record.line, "send failed; aborting session: {err}");
            outcome.abort(records.len() - index);
            break;
        }
        outcome.sent += 1;
        if let Some(sql) = record.sql.as_deref() {
            tracing::debug!(line = record.line, sql, "replayed query");
        }

        let point = tracker.next_point(&payload);
        let wait = tokio::time::timeout(
            options.sync_timeout,
            sync::await_response(&mut reader, point),
        );
        let status = tokio::select! {
            result = wait => match result {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    tracing::warn!(line = record.line, reason = err.kind(), "synchronization failed: {err}");
                    SyncStatus::Failed
                }
                Err(_) => {
                    tracing::warn!(
                        line = record.line,
                        timeout_ms = options.sync_timeout.as_millis() as u64,
                        "server did not answer in time"
                    );
                    SyncStatus::TimedOut
                }
            },
            _ = cancelled(&mut cancel) => SyncStatus::Cancelled,
        };
        append_entry(&log, &session, record, replayed_at, status).await;

        let unsent = records.len() - index - 1;
        if point.ends_session() {
            if unsent > 0 {
                tracing::debug!(unsent, "session terminated before its last record");
                outcome.skipped += unsent as u64;
            }
            break;
        }
        if !status.allows_continue() {
            if status == SyncStatus::EncryptionAccepted {
                tracing::warn!("server accepted encryption; encrypted sessions cannot be replayed");
            }
            outcome.abort(unsent);
            break;
        }
    }

    let _ = writer.shutdown().await;
    tracing::info!(
        sent = outcome.sent,
        skipped = outcome.skipped,
        aborted = outcome.aborted,
        "session finished"
    );
    outcome
}

/// One record goes out as a single write followed by a flush.
async fn send<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn append_entry(
    log: &RecordLog,
    session: &Session,
    record: &ReplayRecord,
    replayed_at: DateTime<Utc>,
    sync: SyncStatus,
) {
    let entry = ReplayLogEntry {
        replayed_at,
        session: session.peer().to_string(),
        direction: record.direction.to_string(),
        message_type: record.message_type.clone(),
        description: record.description.clone(),
        sql: record.sql.clone(),
        raw_hex: record.raw_hex.clone(),
        capture_time: record.capture_time,
        sync,
    };
    if let Err(err) = log.append(&entry).await {
        tracing::warn!(line = record.line, "failed to write replay log entry: {err:#}");
    }
}

/// Returns `false` if the run was cancelled before `deadline`.
async fn sleep_until_or_cancel(deadline: Instant, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => true,
        _ = cancelled(cancel) => false,
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
