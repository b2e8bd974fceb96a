use std::{
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context as _, bail};
use bytes::{BufMut as _, BytesMut};
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinSet,
};
use tracing::Instrument as _;

use crate::{
    config::{BackendAddr, Config},
    record::{
        BackendMetadata, CapturedRecord, Direction, PeerId, SUMMARY_DESCRIPTION,
        SUMMARY_MESSAGE_TYPE, SummaryRecord,
    },
    record_log::RecordLog,
    wire,
};

const BACKEND_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Running capture proxy. Dropping the handle leaves the listener running;
/// call [`CaptureHandle::shutdown`] to stop it and write the run summary.
#[derive(Debug)]
pub struct CaptureHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    context: Arc<CaptureContext>,
}

impl CaptureHandle {
    pub fn log_path(&self) -> PathBuf {
        self.context.log.path().to_path_buf()
    }

    /// Stops accepting, lets in-flight connections finish within the grace
    /// period, then appends the summary record.
    pub async fn shutdown(self) -> anyhow::Result<CaptureSummary> {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.join.await {
            tracing::warn!("capture accept loop ended abnormally: {err}");
        }
        self.context.write_summary().await
    }
}

/// Totals for one capture run, as written to the summary record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub records_written: u64,
    pub records_skipped: u64,
    pub connections_accepted: u64,
    pub log_path: PathBuf,
}

/// State shared by every forwarding loop of one capture run.
#[derive(Debug)]
struct CaptureContext {
    backend: BackendAddr,
    log: RecordLog,
    chunk_size: usize,
    db_user: OnceLock<String>,
    db_name: OnceLock<String>,
    records_written: AtomicU64,
    records_skipped: AtomicU64,
    connections_accepted: AtomicU64,
    started_at: DateTime<Utc>,
    summary_written: AtomicBool,
}

impl CaptureContext {
    fn new(backend: BackendAddr, log: RecordLog, chunk_size: usize) -> Self {
        Self {
            backend,
            log,
            chunk_size,
            db_user: OnceLock::new(),
            db_name: OnceLock::new(),
            records_written: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            started_at: Utc::now(),
            summary_written: AtomicBool::new(false),
        }
    }

    fn backend_metadata(&self) -> BackendMetadata {
        BackendMetadata {
            db_host: self.backend.host.clone(),
            db_port: self.backend.port,
            db_user: self.db_user.get().cloned(),
            db_name: self.db_name.get().cloned(),
        }
    }

    /// Records user/database from the first startup packet seen in the run.
    fn observe_startup(&self, chunk: &[u8]) {
        if self.db_user.get().is_some() && self.db_name.get().is_some() {
            return;
        }
        let Some(params) = wire::parse_startup(chunk) else {
            return;
        };

        if let Some(user) = params.user() {
            let _ = self.db_user.set(user.to_owned());
        }
        if let Some(database) = params.database() {
            let _ = self.db_name.set(database.to_owned());
        }
        tracing::info!(
            user = self.db_user.get().map(String::as_str),
            database = self.db_name.get().map(String::as_str),
            "discovered backend connection parameters"
        );
    }

    async fn persist(&self, record: &CapturedRecord) {
        match self.log.append(record).await {
            Ok(()) => {
                self.records_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.records_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    direction = %record.direction,
                    "failed to persist captured record: {err:#}"
                );
            }
        }
    }

    async fn write_summary(&self) -> anyhow::Result<CaptureSummary> {
        if self.summary_written.swap(true, Ordering::SeqCst) {
            bail!("capture summary was already written");
        }

        let summary = CaptureSummary {
            records_written: self.records_written.load(Ordering::SeqCst),
            records_skipped: self.records_skipped.load(Ordering::SeqCst),
            connections_accepted: self.connections_accepted.load(Ordering::SeqCst),
            log_path: self.log.path().to_path_buf(),
        };
        let record = SummaryRecord {
            direction: Direction::Meta,
            message_type: SUMMARY_MESSAGE_TYPE,
            description: SUMMARY_DESCRIPTION.to_owned(),
            records_written: summary.records_written,
            records_skipped: summary.records_skipped,
            connections_accepted: summary.connections_accepted,
            started_at: self.started_at,
            finished_at: Utc::now(),
            backend: self.backend_metadata(),
        };
        self.log
            .append(&record)
            .await
            .context("append capture summary")?;

        tracing::info!(
            written = summary.records_written,
            skipped = summary.records_skipped,
            connections = summary.connections_accepted,
            "capture finished"
        );
        Ok(summary)
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<CaptureHandle> {
    let capture = &config.capture;
    if capture.chunk_size == 0 {
        bail!("`capture.chunk_size` must be greater than zero");
    }

    if capture.check_backend {
        check_backend_reachable(&capture.backend).await?;
    }

    let log = RecordLog::open(&capture.log_path)?;
    let listener = TcpListener::bind(capture.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", capture.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let context = Arc::new(CaptureContext::new(
        capture.backend.clone(),
        log,
        capture.chunk_size,
    ));
    let grace = Duration::from_millis(capture.shutdown_grace_ms);

    tracing::info!(
        listen = %listen_addr,
        backend = %capture.backend,
        log = %capture.log_path.display(),
        "capture proxy listening"
    );

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let loop_context = Arc::clone(&context);
    let join = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::debug!("accept failed: {err}");
                            continue;
                        }
                    };
                    loop_context.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    let context = Arc::clone(&loop_context);
                    let span = tracing::info_span!("connection", peer = %peer);
                    connections.spawn(handle_connection(stream, peer, context).instrument(span));
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        tracing::warn!("connection task failed: {err}");
                    }
                }
            }
        }
        drop(listener);
        drain_connections(&mut connections, grace).await;
    });

    Ok(CaptureHandle {
        listen_addr,
        shutdown_tx,
        join,
        context,
    })
}

async fn check_backend_reachable(backend: &BackendAddr) -> anyhow::Result<()> {
    let connect = TcpStream::connect((backend.host.as_str(), backend.port));
    match tokio::time::timeout(BACKEND_CHECK_TIMEOUT, connect).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(err)) => bail!("backend {backend} is unreachable: {err}"),
        Err(_) => bail!(
            "backend {backend} did not accept a connection within {}s",
            BACKEND_CHECK_TIMEOUT.as_secs()
        ),
    }
}

async fn drain_connections(connections: &mut JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }

    let in_flight = connections.len();
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::info!(
            in_flight,
            remaining = connections.len(),
            "grace period elapsed; closing remaining connections"
        );
        connections.shutdown().await;
    }
}

async fn handle_connection(client: TcpStream, peer: SocketAddr, context: Arc<CaptureContext>) {
    tracing::info!("client connected");

    let backend =
        match TcpStream::connect((context.backend.host.as_str(), context.backend.port)).await {
            Ok(backend) => backend,
            Err(err) => {
                tracing::warn!(backend = %context.backend, "connect to backend failed: {err}");
                return;
            }
        };
    let _ = client.set_nodelay(true);
    let _ = backend.set_nodelay(true);

    let peer = PeerId::new(peer);
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let (upstream, downstream) = tokio::join!(
        forward(
            client_read,
            backend_write,
            Direction::ClientToServer(peer),
            &context
        ),
        forward(
            backend_read,
            client_write,
            Direction::ServerToClient(peer),
            &context
        ),
    );

    for (direction, result) in [("client -> server", upstream), ("server -> client", downstream)] {
        match result {
            Ok(bytes) => tracing::debug!(direction, bytes, "forwarding finished"),
            Err(err) => tracing::info!(direction, "forwarding stopped: {err}"),
        }
    }
    tracing::info!("connection closed");
}

/// Copies `src` to `dst` one chunk at a time, logging every chunk before it
/// is written. A chunk is fully written and flushed before the next read.
async fn forward<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    context: &CaptureContext,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(context.chunk_size);
    let mut forwarded = 0u64;
    let mut last_capture_time = DateTime::<Utc>::MIN_UTC;

    loop {
        buf.clear();
        let read = src
            .read_buf(&mut (&mut buf).limit(context.chunk_size))
            .await?;
        if read == 0 {
            let _ = dst.shutdown().await;
            return Ok(forwarded);
        }

        let chunk = &buf[..read];
        tracing::trace!(%direction, bytes = read, "chunk");
        context.observe_startup(chunk);

        // Wall clock may step backwards; keep per-loop order intact.
        let capture_time = Utc::now().max(last_capture_time);
        last_capture_time = capture_time;
        let record =
            CapturedRecord::from_chunk(direction, chunk, capture_time, context.backend_metadata());
        context.persist(&record).await;

        dst.write_all(chunk).await?;
        dst.flush().await?;
        forwarded += read as u64;
    }
}
