//! Scripted provider used by the dispatch tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::provider::{
    ChunkSink, GenerationRequest, GenerationResult, ModelProvider, ProviderError, ProviderResult,
    TokenUsage,
};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub struct ScriptedProvider {
    name: String,
    available: bool,
    streaming: bool,
    script: Mutex<VecDeque<ProviderResult<String>>>,
    repeat: Option<ProviderResult<String>>,
    delay: Option<Duration>,
    journal: Option<Journal>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            streaming: false,
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            delay: None,
            journal: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Streams each word of the response as its own chunk.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Responses returned in order; once used up the provider falls back to
    /// `always` or a canned success.
    pub fn with_script(self, responses: Vec<ProviderResult<String>>) -> Self {
        *self.script.lock() = responses.into();
        self
    }

    pub fn always(mut self, response: ProviderResult<String>) -> Self {
        self.repeat = Some(response);
        self
    }

    pub fn always_failing(self, error: ProviderError) -> Self {
        self.always(Err(error))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn record(&self, event: &str, request: &GenerationRequest) {
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .push(format!("{}:{}:{}", request.display_label(), self.name, event));
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn get_provider_name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<GenerationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        self.record("start", request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().pop_front();
        let response = next
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| Ok(format!("response from {}", self.name)));

        self.record("end", request);
        response.map(|text| {
            GenerationResult::new(request, &self.name, "scripted-model", text)
                .with_usage(TokenUsage::new(3, 2))
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        sink: &ChunkSink,
    ) -> ProviderResult<GenerationResult> {
        let result = self.generate(request).await?;
        if self.streaming {
            for word in result.text.split_inclusive(' ') {
                sink.send(word, None);
            }
        } else {
            sink.send(result.text.clone(), result.finish_reason.clone());
        }
        Ok(result)
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}
