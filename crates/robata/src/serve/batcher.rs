use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use crate::config::BatcherConfig;
use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::generation::Generator;
use crate::request::GenerationRequest;
use crate::tokenizer::Tokenizer;
use super::queue_item::PendingRequest;
use super::scheduler::generation_loop;
use super::stream::GenerationStream;
use super::worker::WorkerHandle;
use super::GenerationBatcher;

/// # ContinuousBatcher
///
/// Owns the request queue and the background task running the generation
/// loop. Dropping it stops the task after the step in flight.
pub struct ContinuousBatcher {
    waiting: Arc<Mutex<Vec<PendingRequest>>>,
    handle: WorkerHandle,
}

impl ContinuousBatcher {
    /// Starts the generation loop on the current tokio runtime.
    ///
    /// The loop emits every row itself, so `generator` must run as the only
    /// shard.
    pub fn new<E, T>(generator: Generator<E, T>, config: BatcherConfig) -> Result<Self>
    where
        E: InferenceEngine + 'static,
        T: Tokenizer + 'static,
    {
        config.validate()?;
        if generator.shard().world_size != 1 {
            return Err(Error::Configuration(format!(
                "continuous batching runs a single shard, got world_size {}",
                generator.shard().world_size
            )));
        }

        let waiting = Arc::new(Mutex::new(Vec::new()));
        let handle = WorkerHandle::new({
            let waiting = waiting.clone();
            move |running, notifier| {
                tokio::spawn(generation_loop(generator, config, running, notifier, waiting))
            }
        });

        Ok(Self { waiting, handle })
    }

    /// Requests waiting for admission.
    pub async fn waiting(&self) -> usize {
        self.waiting.lock().await.len()
    }

    /// Stops the generation loop and waits for it to exit.
    ///
    /// Streams of unfinished requests end without a completed generation.
    pub async fn shutdown(mut self) {
        self.handle.join().await;
    }
}

#[async_trait]
impl GenerationBatcher for ContinuousBatcher {
    async fn run(&self, request: GenerationRequest) -> Result<GenerationStream> {
        request.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = request.id;
        {
            let mut waiting = self.waiting.lock().await;
            waiting.push(PendingRequest::new(request, tx));
        }
        debug!(%request_id, "queued request");
        self.handle.notify();
        Ok(GenerationStream::new(request_id, rx))
    }
}
