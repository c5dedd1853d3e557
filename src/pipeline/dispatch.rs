// Batch dispatch
//
// A flush takes the whole buffer generation, plans it into chunks and sends
// them one at a time through the circuit breaker. Whatever was not
// acknowledged goes back into the live buffer; repeated failures end in the
// durable snapshot.
//
// One generation is out at a time. A batch that stops partway keeps its id
// and resumes chunk numbering at the chunk that failed, so an acknowledged
// id is never reused for different records.

use super::durability::StoredSnapshot;
use super::{Inner, PipelineState, ANONYMOUS_USER};
use clicktally_breaker::BreakerError;
use clicktally_core::{plan_chunks, BatchPayload, ClickRecord, PlannedChunk};
use clicktally_writer::WriterError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A buffer generation on its way to the sink.
#[derive(Debug)]
pub(super) struct OutboundBatch {
    pub(super) batch_id: String,
    /// Chunk index to number from; non-zero when resuming a batch.
    pub(super) first_chunk: usize,
    pub(super) records: Vec<ClickRecord>,
}

/// Where a batch that did not fully go through picks up again.
#[derive(Debug, Clone)]
pub(super) struct InterruptedBatch {
    batch_id: String,
    next_chunk: usize,
}

/// How a delivery attempt ended.
#[derive(Debug)]
enum Delivery {
    Delivered,
    /// Stopped at chunk `next_chunk`; `unsent` holds it and everything after.
    Interrupted {
        unsent: Vec<ClickRecord>,
        next_chunk: usize,
        error: BreakerError<WriterError>,
    },
}

impl PipelineState {
    /// Id and first chunk index for the next outbound generation. An
    /// interrupted batch is resumed unless another delivery is still out.
    pub(super) fn next_batch_id(&mut self, window: Duration) -> (String, usize) {
        if !self.in_flight {
            if let Some(interrupted) = self.interrupted.take() {
                return (interrupted.batch_id, interrupted.next_chunk);
            }
        }

        let user_id = self.user_id.as_deref().unwrap_or(ANONYMOUS_USER);
        let now_ms = chrono::Utc::now().timestamp_millis();
        (self.batch_ids.issue(user_id, now_ms, window), 0)
    }
}

impl Inner {
    pub(super) async fn flush(&self) {
        let batch = {
            let mut state = self.state.lock();
            self.take_batch(&mut state)
        };
        if let Some(batch) = batch {
            self.deliver(batch).await;
        }
    }

    /// Snapshot-and-clear the buffer for delivery.
    ///
    /// Leaves the buffer alone when it is empty, while an earlier generation
    /// is still being delivered, or when the circuit is open. An open circuit
    /// keeps a timer armed so the entries get another chance; a delivery that
    /// settles re-arms it itself.
    pub(super) fn take_batch(&self, state: &mut PipelineState) -> Option<OutboundBatch> {
        if state.buffer.is_empty() {
            return None;
        }

        if state.in_flight {
            debug!(
                buffered = state.buffer.len(),
                "Delivery in flight, leaving entries buffered"
            );
            return None;
        }

        let key = &self.config.dispatch.breaker_key;
        if self.breaker.is_open(key) {
            debug!(
                circuit = %key,
                buffered = state.buffer.len(),
                "Circuit open, leaving entries buffered"
            );
            self.arm_if_idle(state);
            return None;
        }

        let records = state.buffer.snapshot_and_clear();
        self.disarm(state);
        let (batch_id, first_chunk) = state.next_batch_id(self.config.dispatch.batch_window());
        state.in_flight = true;

        Some(OutboundBatch {
            batch_id,
            first_chunk,
            records,
        })
    }

    /// Send a taken generation and settle the outcome.
    pub(super) async fn deliver(&self, batch: OutboundBatch) {
        let OutboundBatch {
            batch_id,
            first_chunk,
            records,
        } = batch;
        let entries = records.len();
        let chunks = plan_chunks(&batch_id, records, self.chunk_limits(), first_chunk);

        match self.send_chunks(chunks).await {
            Delivery::Delivered => self.on_delivered(&batch_id, entries).await,
            Delivery::Interrupted {
                unsent,
                next_chunk,
                error,
            } => {
                let interrupted = InterruptedBatch {
                    batch_id,
                    next_chunk,
                };
                if error.is_open() {
                    self.requeue(interrupted, unsent);
                } else {
                    self.retry_or_defer(interrupted, unsent, error).await;
                }
            }
        }
    }

    async fn send_chunks(&self, chunks: Vec<PlannedChunk>) -> Delivery {
        let total = chunks.len();
        let mut remaining = chunks.into_iter();
        let mut sent = 0;

        while let Some(chunk) = remaining.next() {
            if sent > 0 {
                tokio::time::sleep(self.config.dispatch.chunk_delay()).await;
            }

            match self.send_payload(&chunk.payload).await {
                Ok(()) => {
                    debug!(
                        batch_id = %chunk.payload.batch_id,
                        chunk = chunk.index,
                        chunks = total,
                        entries = chunk.records.len(),
                        "Chunk delivered"
                    );
                    sent += 1;
                }
                Err(error) => {
                    let next_chunk = chunk.index;
                    let unsent: Vec<ClickRecord> = chunk
                        .records
                        .into_iter()
                        .chain(remaining.by_ref().flat_map(|c| c.records))
                        .collect();
                    return Delivery::Interrupted {
                        unsent,
                        next_chunk,
                        error,
                    };
                }
            }
        }

        Delivery::Delivered
    }

    /// One guarded call to the sink. A `success: false` reply is a failure.
    async fn send_payload(&self, payload: &BatchPayload) -> Result<(), BreakerError<WriterError>> {
        let sink = Arc::clone(&self.sink);
        self.breaker
            .execute(
                &self.config.dispatch.breaker_key,
                || async move {
                    let response = sink.send(payload).await?;
                    if response.success {
                        Ok(())
                    } else {
                        Err(WriterError::batch_failed(
                            response
                                .error
                                .unwrap_or_else(|| "no error message".to_string()),
                        ))
                    }
                },
                &self.breaker_options,
            )
            .await
    }

    async fn on_delivered(&self, batch_id: &str, entries: usize) {
        let refresh_mirror = {
            let mut state = self.state.lock();
            state.in_flight = false;
            state.retry_count = 0;
            state.buffer.mark_flush_success(Instant::now().into_std());
            // Clicks that arrived while this batch was out.
            if !state.buffer.is_empty() {
                self.arm_if_idle(&mut state);
            }
            state.stored == StoredSnapshot::Mirror
        };

        info!(batch_id = %batch_id, entries, "Batch delivered");

        // The safety-net copy still holds what was just delivered.
        if refresh_mirror {
            self.persist().await;
        }
    }

    /// The circuit opened between chunks. No retry is consumed.
    fn requeue(&self, interrupted: InterruptedBatch, unsent: Vec<ClickRecord>) {
        let mut state = self.state.lock();
        state.in_flight = false;
        let merged = state.buffer.merge(unsent);
        self.arm_if_idle(&mut state);
        warn!(
            batch_id = %interrupted.batch_id,
            next_chunk = interrupted.next_chunk,
            entries = merged,
            "Circuit opened during delivery, entries returned to buffer"
        );
        state.interrupted = Some(interrupted);
    }

    async fn retry_or_defer(
        &self,
        interrupted: InterruptedBatch,
        unsent: Vec<ClickRecord>,
        error: BreakerError<WriterError>,
    ) {
        let max_retries = self.config.dispatch.max_retries;

        let exhausted = {
            let mut state = self.state.lock();
            state.in_flight = false;
            state.retry_count += 1;
            let attempt = state.retry_count;
            state.buffer.merge(unsent);

            if attempt < max_retries {
                let delay = self.config.dispatch.retry_backoff(attempt);
                self.arm(&mut state, Instant::now() + delay);
                warn!(
                    batch_id = %interrupted.batch_id,
                    next_chunk = interrupted.next_chunk,
                    attempt,
                    max_retries,
                    ?delay,
                    error = %error,
                    "Batch delivery failed, retry scheduled"
                );
                state.interrupted = Some(interrupted);
                None
            } else {
                state.retry_count = 0;
                state.interrupted = None;
                self.disarm(&mut state);
                error!(
                    batch_id = %interrupted.batch_id,
                    attempt,
                    error = %error,
                    "Batch delivery retries exhausted, deferring to durable storage"
                );
                Some(state.buffer.snapshot_and_clear())
            }
        };

        if let Some(records) = exhausted {
            self.defer(records).await;
        }
    }
}
