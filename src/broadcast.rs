//! The broadcast engine.
//!
//! One reader task owns the source.
//! Every chunk it reads is put on a [`broadcast`] channel, which it never waits on.
//! Each endpoint has a worker subscribed to that channel, forwarding chunks to its own sink.
//!
//! A worker that can not keep up falls behind on the channel and loses its oldest chunks.
//! Nobody else notices.

use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{future::join_all, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::broadcast,
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{endpoint::EndpointSpec, error::Error, provision::ProvisionPolicy};

/// Largest chunk read from the source at once.
pub const CHUNK_SIZE: usize = 4096;

/// Creates the OS-level resource behind an endpoint.
///
/// For real use this is a pseudo terminal, see [`crate::virtual_port::PtyFactory`].
/// Tests hand out in-memory pipes instead.
pub trait SinkFactory: Send + Sync + 'static {
    /// What workers write into.
    type Sink: AsyncWrite + Send + Unpin + 'static;

    /// Bring up the sink for this endpoint.
    /// When this returns the endpoint should be openable by consumers.
    fn allocate(&self, endpoint: &EndpointSpec) -> Result<Self::Sink, Error>;
}

/// Knobs for [`start`].
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// How many chunks a worker may fall behind before it starts losing data.
    pub queue_depth: usize,

    /// What to do when an endpoint can not be allocated.
    pub policy: ProvisionPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            policy: ProvisionPolicy::default(),
        }
    }
}

/// Why the source reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEnd {
    /// End of stream, e.g. the device was unplugged.
    Eof,

    /// Reading failed.
    Failed(String),

    /// We were told to stop.
    Cancelled,
}

impl Display for SourceEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceEnd::Eof => write!(f, "end of stream"),
            SourceEnd::Failed(problem) => write!(f, "read failed: {problem}"),
            SourceEnd::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The source ended and everything queued was written.
    SourceClosed,

    /// Stopped on request.
    Cancelled,

    /// Writing to the sink failed.
    SinkFailed(String),

    /// Did not stop in time and was aborted.
    Aborted,

    /// The task panicked.
    Panicked(String),
}

/// Counters a worker keeps.
#[derive(Debug, Default)]
pub struct WorkerStats {
    bytes_written: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl WorkerStats {
    /// Bytes successfully written to the sink.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Chunks lost because the worker fell behind.
    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
}

/// A running worker bound to one endpoint.
/// Only the [`FanoutTopology`] holds these.
#[derive(Debug)]
pub struct WorkerHandle {
    endpoint: EndpointSpec,
    handle: JoinHandle<WorkerExit>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    fn spawn<W>(
        endpoint: EndpointSpec,
        sink: W,
        chunks: broadcast::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stats = Arc::new(WorkerStats::default());
        let span = info_span!("endpoint", path = %endpoint);

        let handle = tokio::spawn(forward(sink, chunks, cancel, stats.clone()).instrument(span));

        Self {
            endpoint,
            handle,
            stats,
        }
    }

    /// The endpoint this worker serves.
    pub fn endpoint(&self) -> &EndpointSpec {
        &self.endpoint
    }

    /// The worker's counters.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Has the worker stopped?
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn forward<W>(
    mut sink: W,
    chunks: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
) -> WorkerExit
where
    W: AsyncWrite + Unpin,
{
    let mut chunks = BroadcastStream::new(chunks);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerExit::Cancelled,
            next = chunks.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                stats.chunks_dropped.fetch_add(missed, Ordering::Relaxed);
                debug!(%missed, "Endpoint fell behind, dropped oldest chunks");
                continue;
            }
            None => {
                debug!("Source closed, worker done");
                return WorkerExit::SourceClosed;
            }
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerExit::Cancelled,
            written = sink.write_all(&chunk) => written,
        };

        match written {
            Ok(()) => {
                stats
                    .bytes_written
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                trace!(len = chunk.len(), "Forwarded chunk");
            }
            Err(e) => {
                warn!(?e, "Writing to endpoint failed, worker stopping");
                return WorkerExit::SinkFailed(e.to_string());
            }
        }
    }
}

async fn read_source<R>(
    mut source: R,
    chunks: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
) -> SourceEnd
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SourceEnd::Cancelled,
            read = source.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                warn!("Source reached end of stream");
                return SourceEnd::Eof;
            }
            Ok(len) => {
                trace!(%len, "Read from source");

                // Only fails if there are no workers left.
                if let Err(e) = chunks.send(buf.freeze()) {
                    debug!(len = e.0.len(), "No workers left to receive chunk");
                }
            }
            Err(e) => {
                error!(?e, "Reading from source failed");
                return SourceEnd::Failed(e.to_string());
            }
        }
    }
}

/// How a single worker ended up during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// The endpoint the worker served.
    pub endpoint: EndpointSpec,

    /// Why it stopped.
    pub exit: WorkerExit,

    /// Bytes it wrote in total.
    pub bytes_written: u64,

    /// Chunks it lost by falling behind.
    pub chunks_dropped: u64,
}

/// What happened during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// One entry per worker, ordered by endpoint id.
    pub workers: Vec<WorkerReport>,
}

impl ShutdownReport {
    /// How many workers had to be aborted.
    pub fn aborted(&self) -> usize {
        self.workers
            .iter()
            .filter(|report| report.exit == WorkerExit::Aborted)
            .count()
    }
}

/// A running fanout: one source reader and one worker per endpoint.
#[derive(Debug)]
pub struct FanoutTopology {
    endpoints: Vec<EndpointSpec>,
    workers: BTreeMap<u32, WorkerHandle>,
    reader: JoinHandle<SourceEnd>,
    source_end: Option<SourceEnd>,
    cancel: CancellationToken,
}

/// Bring up a sink per endpoint, then start reading `source` and replicating it to all of them.
///
/// Every worker is subscribed before the first read, so each sees the stream from its first byte.
///
/// With [`ProvisionPolicy::BestEffort`] endpoints which fail to allocate are skipped,
/// and only an empty result is an error ([`Error::NoEndpoints`]).
/// With [`ProvisionPolicy::FailFast`] the first failure is returned and nothing is left running.
pub fn start<R, F>(
    source: R,
    endpoints: Vec<EndpointSpec>,
    factory: &F,
    options: EngineOptions,
) -> Result<FanoutTopology, Error>
where
    R: AsyncRead + Send + Unpin + 'static,
    F: SinkFactory,
{
    let (chunks, _) = broadcast::channel(options.queue_depth.max(1));
    let cancel = CancellationToken::new();

    let mut workers = BTreeMap::new();
    let mut started = Vec::with_capacity(endpoints.len());

    for endpoint in endpoints.iter() {
        match factory.allocate(endpoint) {
            Ok(sink) => {
                info!(%endpoint, "Endpoint up");
                let worker = WorkerHandle::spawn(
                    endpoint.clone(),
                    sink,
                    chunks.subscribe(),
                    cancel.child_token(),
                );
                workers.insert(endpoint.id, worker);
                started.push(endpoint.clone());
            }
            Err(e) => match options.policy {
                ProvisionPolicy::BestEffort => {
                    error!(%endpoint, %e, "Could not bring up endpoint, skipping it");
                }
                ProvisionPolicy::FailFast => {
                    error!(%endpoint, %e, "Could not bring up endpoint, giving up");
                    cancel.cancel();
                    for worker in workers.values() {
                        worker.handle.abort();
                    }
                    return Err(e);
                }
            },
        }
    }

    if started.is_empty() && !endpoints.is_empty() {
        return Err(Error::NoEndpoints);
    }

    let reader = tokio::spawn(
        read_source(source, chunks, cancel.child_token()).instrument(info_span!("source")),
    );

    info!(endpoints = started.len(), "Fanout running");

    Ok(FanoutTopology {
        endpoints: started,
        workers,
        reader,
        source_end: None,
        cancel,
    })
}

impl FanoutTopology {
    /// The endpoints that are being served, ascending by id.
    pub fn endpoints(&self) -> &[EndpointSpec] {
        &self.endpoints
    }

    /// The worker serving the endpoint with this id.
    pub fn worker(&self, id: u32) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    /// How many workers are still running.
    pub fn live_workers(&self) -> usize {
        self.workers.values().filter(|w| !w.is_finished()).count()
    }

    /// Resolves once the source is gone.
    ///
    /// Cancel safe, and may be awaited again after resolving.
    pub async fn source_lost(&mut self) -> Error {
        if self.source_end.is_none() {
            let end = match (&mut self.reader).await {
                Ok(end) => end,
                Err(e) => SourceEnd::Failed(format!("reader task failed: {e}")),
            };
            self.source_end = Some(end);
        }

        let end = self.source_end.clone().unwrap_or(SourceEnd::Eof);
        Error::SourceLost(end.to_string())
    }

    /// Stop everything now.
    ///
    /// Workers are told to stop and get `grace` to do so, after which they are aborted.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        debug!(?grace, "Cancelling workers");
        self.cancel.cancel();
        self.join(grace).await
    }

    /// Let workers write out what they have queued, then stop.
    ///
    /// Meant for when the source is gone: workers stop on their own once drained.
    /// Anyone not done within `grace` is aborted.
    pub async fn drain(self, grace: Duration) -> ShutdownReport {
        debug!(?grace, "Draining workers");
        self.join(grace).await
    }

    async fn join(self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;

        let reader = self.reader;
        let cancel = self.cancel;
        let source_end = self.source_end;

        let workers = join_all(self.workers.into_values().map(|mut worker| async move {
            let exit = match timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => WorkerExit::Panicked(e.to_string()),
                Err(_elapsed) => {
                    warn!(endpoint = %worker.endpoint, "Worker did not stop in time, aborting");
                    worker.handle.abort();
                    let _ = (&mut worker.handle).await;
                    WorkerExit::Aborted
                }
            };

            WorkerReport {
                endpoint: worker.endpoint,
                exit,
                bytes_written: worker.stats.bytes_written(),
                chunks_dropped: worker.stats.chunks_dropped(),
            }
        }))
        .await;

        // The reader only lingers if we are draining while the source is still up.
        // Its output may already have been taken by `source_lost`.
        cancel.cancel();
        if source_end.is_none() {
            let _ = reader.await;
        }

        info!(
            workers = workers.len(),
            aborted = workers.iter().filter(|w| w.exit == WorkerExit::Aborted).count(),
            "Fanout stopped"
        );

        ShutdownReport { workers }
    }
}
