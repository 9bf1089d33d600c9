use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::batch::{BatchState, RowState};
use crate::config::BatcherConfig;
use crate::engine::InferenceEngine;
use crate::generation::Generator;
use crate::request::{Batch, Generation};
use crate::tensor::constant::SEQ_DIM;
use crate::tokenizer::Tokenizer;
use super::queue_item::PendingRequest;

/// Drives the single active batch until `running` is cleared.
///
/// Each iteration admits waiting requests (ingest, first step, merge), runs
/// one step over the active batch, routes the records and then filters out
/// finished and cancelled rows.
pub(crate) async fn generation_loop<E, T>(
    generator: Generator<E, T>,
    config: BatcherConfig,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    waiting: Arc<Mutex<Vec<PendingRequest>>>,
) where
    E: InferenceEngine,
    T: Tokenizer,
{
    info!(max_batch_size = config.max_batch_size, "generation worker started");
    let mut state = LoopState::default();

    while running.load(Ordering::SeqCst) {
        if state.active.is_none() && !has_waiting(&waiting).await {
            // Nothing to do, wait for a notification or poll again
            let _ = timeout(config.idle_poll(), notifier.notified()).await;
            continue;
        }

        let admitted =
            drain_admissible(&waiting, &config, state.active.as_ref(), generator.tokenizer()).await;
        if !admitted.is_empty() {
            state.admit(&generator, admitted).await;
        }
        state.step(&generator).await;
        // Let submitters and stream readers run between steps
        tokio::task::yield_now().await;
    }

    state.close_all();
    info!("generation worker stopped");
}

async fn has_waiting(waiting: &Mutex<Vec<PendingRequest>>) -> bool {
    !waiting.lock().await.is_empty()
}

/// Takes as many waiting requests as fit the batch size and token budget.
///
/// A request counts the way ingest sizes it: every admitted row is padded to
/// the longest admitted prompt and reserves its `max_new_tokens`. An idle
/// loop always admits at least one request so an oversized request cannot
/// block the queue forever.
pub(crate) async fn drain_admissible<T: Tokenizer>(
    waiting: &Mutex<Vec<PendingRequest>>,
    config: &BatcherConfig,
    active: Option<&BatchState>,
    tokenizer: &T,
) -> Vec<PendingRequest> {
    let mut waiting = waiting.lock().await;
    waiting.retain(|pending| {
        let cancelled = pending.is_cancelled();
        if cancelled {
            debug!(request_id = %pending.id(), "dropping request cancelled before admission");
        }
        !cancelled
    });

    let active_rows = active.map_or(0, BatchState::len);
    let active_tokens = active.map_or(0, BatchState::max_tokens);
    let slots = config.max_batch_size.saturating_sub(active_rows);
    if config.max_batch_total_tokens.is_some() {
        measure_prompts(&mut waiting, slots, tokenizer).await;
    }

    let mut take = 0;
    let mut input_length = 0;
    let mut new_tokens = 0u64;
    for pending in waiting.iter().take(slots) {
        let request = pending.request();
        let length = input_length.max(pending.input_length().unwrap_or(request.truncate));
        let reserved = new_tokens + request.stopping_parameters.max_new_tokens as u64;
        let tokens = active_tokens + ((take + 1) * length) as u64 + reserved;
        let idle = active_rows == 0 && take == 0;
        if let Some(limit) = config.max_batch_total_tokens {
            if tokens > limit && !idle {
                break;
            }
        }
        input_length = length;
        new_tokens = reserved;
        take += 1;
    }
    waiting.drain(..take).collect()
}

/// Tokenizes the prompts of the first `count` waiting requests that have no
/// known length yet. Requests whose prompt cannot be encoded are dropped.
async fn measure_prompts<T: Tokenizer>(
    waiting: &mut Vec<PendingRequest>,
    count: usize,
    tokenizer: &T,
) {
    let mut failed = Vec::new();
    for (i, pending) in waiting.iter_mut().take(count).enumerate() {
        if pending.input_length().is_some() {
            continue;
        }
        let request = pending.request();
        let encoded = tokenizer
            .encode_batch(&[request.inputs.as_str()], request.truncate)
            .await
            .and_then(|encoded| Ok(encoded.input_ids.dim(SEQ_DIM)?));
        match encoded {
            Ok(input_length) => pending.set_input_length(input_length),
            Err(e) => {
                error!(request_id = %pending.id(), "cannot tokenize prompt: {e}");
                failed.push(i);
            }
        }
    }
    for i in failed.into_iter().rev() {
        waiting.remove(i);
    }
}

#[derive(Default)]
struct LoopState {
    active: Option<BatchState>,
    streams: HashMap<Uuid, mpsc::UnboundedSender<Generation>>,
    next_batch_id: u64,
}

impl LoopState {
    /// Prefills `pending` as a new batch and merges it into the active one.
    async fn admit<E, T>(&mut self, generator: &Generator<E, T>, pending: Vec<PendingRequest>)
    where
        E: InferenceEngine,
        T: Tokenizer,
    {
        let id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut requests = Vec::with_capacity(pending.len());
        for item in pending {
            let (request, sender) = item.into_parts();
            self.streams.insert(request.id, sender);
            requests.push(request);
        }
        let ids = requests.iter().map(|r| r.id).collect::<Vec<_>>();
        debug!(batch_id = id, size = ids.len(), "admitting requests");

        let batch = match generator.ingest(Batch { id, requests }).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(batch_id = id, "cannot ingest batch: {e}");
                self.close(&ids);
                return;
            }
        };
        let Some(prefilled) = self.run_step(generator, batch).await else {
            return;
        };
        let Some(prefilled) = self.retain_live(prefilled) else {
            return;
        };

        self.active = match self.active.take() {
            None => Some(prefilled),
            Some(active) => {
                let ids = [active.request_ids(), prefilled.request_ids()].concat();
                match BatchState::concatenate(vec![active, prefilled]) {
                    Ok(merged) => Some(merged),
                    Err(e) => {
                        error!("cannot merge batches: {e}");
                        self.close(&ids);
                        None
                    }
                }
            }
        };
    }

    /// Runs one step over the active batch.
    async fn step<E, T>(&mut self, generator: &Generator<E, T>)
    where
        E: InferenceEngine,
        T: Tokenizer,
    {
        let Some(batch) = self.active.take() else {
            return;
        };
        self.active = match self.run_step(generator, batch).await {
            Some(next) => self.retain_live(next),
            None => None,
        };
    }

    async fn run_step<E, T>(
        &mut self,
        generator: &Generator<E, T>,
        batch: BatchState,
    ) -> Option<BatchState>
    where
        E: InferenceEngine,
        T: Tokenizer,
    {
        let (batch_id, ids) = (batch.id(), batch.request_ids());
        match generator.generate_token(batch).await {
            Ok((generations, next)) => {
                self.dispatch(generations);
                if next.is_none() {
                    self.close(&ids);
                }
                next
            }
            Err(e) => {
                error!(batch_id, "dropping batch after failed step: {e}");
                self.close(&ids);
                None
            }
        }
    }

    fn dispatch(&mut self, generations: Vec<Generation>) {
        for generation in generations {
            let request_id = generation.request_id;
            let finished = generation.is_finished();
            let delivered = self
                .streams
                .get(&request_id)
                .is_some_and(|sender| sender.send(generation).is_ok());
            if !delivered {
                debug!(%request_id, "client stream is gone");
            }
            if finished || !delivered {
                self.streams.remove(&request_id);
            }
        }
    }

    /// Filters `batch` to rows that are still generating for an open stream.
    fn retain_live(&mut self, mut batch: BatchState) -> Option<BatchState> {
        let live = batch
            .rows()
            .iter()
            .filter(|row| !row.is_finished() && self.is_listening(&row.id()))
            .map(RowState::id)
            .collect::<Vec<_>>();
        let gone = batch
            .request_ids()
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect::<Vec<_>>();
        self.close(&gone);

        if live.is_empty() {
            return None;
        }
        match batch.filter(&live) {
            Ok(()) => Some(batch),
            Err(e) => {
                error!(batch_id = batch.id(), "cannot filter batch: {e}");
                self.close(&live);
                None
            }
        }
    }

    fn is_listening(&self, request_id: &Uuid) -> bool {
        self.streams.get(request_id).is_some_and(|sender| !sender.is_closed())
    }

    fn close(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.streams.remove(id);
        }
    }

    fn close_all(&mut self) {
        if !self.streams.is_empty() {
            warn!(open = self.streams.len(), "closing streams of unfinished requests");
        }
        self.streams.clear();
        self.active = None;
    }
}
