use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{DispatchFailure, Error, Result};
use crate::models::fallback::{FallbackConfig, FallbackExecutor, ProviderStats, SharedStats};
use crate::models::provider::{GenerationRequest, GenerationResult, StreamChunk};
use crate::models::registry::ProviderRegistry;

const DEFAULT_STREAM_BUFFER: usize = 64;

struct QueueEntry {
    sequence: u64,
    request: GenerationRequest,
    reply: oneshot::Sender<Result<GenerationResult>>,
    stream: Option<mpsc::Sender<StreamChunk>>,
}

/// Handle to the serialized dispatch pipeline.
///
/// One worker task owns the executor and its rate-limit state and processes
/// queued requests strictly one at a time in submission order. Handles are
/// cheap to clone; the worker stops once every handle is dropped.
#[derive(Clone)]
pub struct RequestQueue {
    sender: mpsc::UnboundedSender<QueueEntry>,
    registry: Arc<ProviderRegistry>,
    sequence: Arc<AtomicU64>,
    stats: SharedStats,
    stream_buffer: usize,
}

/// Chunks of a streamed request plus its terminal outcome.
///
/// The worker never waits for `chunks` to be read. A reader that falls more
/// than the stream buffer behind loses the rest of that attempt's chunks, so
/// the text of the terminal result is the authoritative output.
pub struct StreamingResponse {
    pub chunks: mpsc::Receiver<StreamChunk>,
    result: oneshot::Receiver<Result<GenerationResult>>,
}

impl StreamingResponse {
    /// Waits for the terminal result, discarding any chunks not yet read.
    pub async fn finish(self) -> Result<GenerationResult> {
        self.result.await.map_err(|_| Error::QueueClosed)?
    }
}

impl RequestQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn start(registry: ProviderRegistry, config: FallbackConfig) -> Self {
        let registry = Arc::new(registry);
        let executor = FallbackExecutor::new(Arc::clone(&registry), config);
        let stats = executor.stats_handle();
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(drain(executor, receiver));
        info!("Request queue started with {} providers", registry.len());

        Self {
            sender,
            registry,
            sequence: Arc::new(AtomicU64::new(0)),
            stats,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn stats(&self) -> HashMap<String, ProviderStats> {
        self.stats.read().clone()
    }

    /// Queues a request and waits for its outcome. `provider_name`, when
    /// given, overrides any provider already set on the request.
    pub async fn send_request(
        &self,
        request: GenerationRequest,
        provider_name: Option<&str>,
    ) -> Result<GenerationResult> {
        let reply = self.enqueue(request, provider_name, None)?;
        reply.await.map_err(|_| Error::QueueClosed)?
    }

    pub async fn send_streaming_request(
        &self,
        request: GenerationRequest,
        provider_name: Option<&str>,
    ) -> Result<StreamingResponse> {
        let (chunk_tx, chunk_rx) = mpsc::channel(self.stream_buffer);
        let result = self.enqueue(request, provider_name, Some(chunk_tx))?;
        Ok(StreamingResponse {
            chunks: chunk_rx,
            result,
        })
    }

    fn enqueue(
        &self,
        mut request: GenerationRequest,
        provider_name: Option<&str>,
        stream: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<oneshot::Receiver<Result<GenerationResult>>> {
        if let Some(name) = provider_name {
            request.provider = Some(name.to_string());
        }

        if !self.registry.has_available_providers() {
            warn!("Rejecting request {}: no providers available", request.display_label());
            return Err(Error::Exhausted(DispatchFailure::no_eligible_providers(
                request.provider.clone(),
            )));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let (reply, receiver) = oneshot::channel();
        debug!("Enqueued request {} as #{}", request.display_label(), sequence);

        self.sender
            .send(QueueEntry {
                sequence,
                request,
                reply,
                stream,
            })
            .map_err(|_| Error::QueueClosed)?;
        Ok(receiver)
    }
}

async fn drain(mut executor: FallbackExecutor, mut receiver: mpsc::UnboundedReceiver<QueueEntry>) {
    while let Some(entry) = receiver.recv().await {
        debug!("Processing queued request #{}", entry.sequence);
        let outcome = executor.execute(&entry.request, entry.stream.as_ref()).await;
        if entry.reply.send(outcome).is_err() {
            debug!("Caller for request #{} went away before completion", entry.sequence);
        }
    }
    info!("Request queue closed");
}
