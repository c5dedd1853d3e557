// Dispatcher worker and host lifecycle hooks
//
// The worker is the only task that owns the flush timer. Signals arrive in
// the order they were sent under the state lock, so a disarm followed by a
// re-arm is never observed the other way round.

use super::dispatch::OutboundBatch;
use super::durability::StoredSnapshot;
use super::Inner;
use clicktally_core::{plan_chunks, ClickRecord};
use std::sync::Weak;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(super) enum Signal {
    /// Replace the pending timer with one firing at this instant.
    Arm(Instant),
    Disarm,
    /// Deliver a generation taken by a forced flush.
    Dispatch(OutboundBatch),
    Shutdown,
}

enum Event {
    Signal(Option<Signal>),
    TimerFired,
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

pub(super) async fn run_worker(inner: Weak<Inner>, mut signals: UnboundedReceiver<Signal>) {
    let mut deadline: Option<Instant> = None;
    debug!("Dispatcher worker started");

    loop {
        let event = tokio::select! {
            signal = signals.recv() => Event::Signal(signal),
            _ = wait_for(deadline) => Event::TimerFired,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            Event::Signal(Some(Signal::Arm(at))) => deadline = Some(at),
            Event::Signal(Some(Signal::Disarm)) => deadline = None,
            Event::Signal(Some(Signal::Dispatch(batch))) => inner.deliver(batch).await,
            Event::Signal(Some(Signal::Shutdown)) | Event::Signal(None) => break,
            Event::TimerFired => {
                deadline = None;
                inner.state.lock().timer_armed = false;
                debug!("Flush timer fired");
                inner.flush().await;
            }
        }
    }

    debug!("Dispatcher worker stopped");
}

impl Inner {
    /// Persist first so an interrupted flush still leaves a recoverable copy.
    pub(super) async fn on_hidden(&self) {
        debug!("Host hidden, persisting and flushing");
        self.persist().await;
        self.flush().await;
    }

    /// Hand the buffer to the beacon. Circuit and retry state are untouched.
    pub(super) async fn on_unload(&self) {
        let foreign = self.state.lock().stored.may_hold_foreign_records();
        if foreign {
            self.persist().await;
        }

        let (records, batch_id, first_chunk) = {
            let mut state = self.state.lock();
            let records = state.buffer.snapshot_and_clear();
            if records.is_empty() {
                return;
            }
            let (batch_id, first_chunk) =
                state.next_batch_id(self.config.dispatch.batch_window());
            (records, batch_id, first_chunk)
        };

        let entries = records.len();
        let mut chunks =
            plan_chunks(&batch_id, records, self.chunk_limits(), first_chunk).into_iter();

        while let Some(chunk) = chunks.next() {
            if self.beacon.send(chunk.payload) {
                continue;
            }

            let unsent: Vec<ClickRecord> = chunk
                .records
                .into_iter()
                .chain(chunks.by_ref().flat_map(|c| c.records))
                .collect();
            warn!(
                batch_id = %batch_id,
                entries = unsent.len(),
                "Beacon refused payload, persisting instead"
            );
            self.state.lock().buffer.merge(unsent);
            self.persist().await;
            return;
        }

        info!(batch_id = %batch_id, entries, "Handed buffer to unload beacon");

        // Deferred records that could not be read back are still only in storage.
        if self.state.lock().stored.may_hold_foreign_records() {
            return;
        }

        match self.store.remove(&self.config.storage.snapshot_key).await {
            Ok(()) => self.state.lock().stored = StoredSnapshot::Empty,
            Err(e) => warn!(error = %e, "Failed to clear click snapshot after unload"),
        }
    }
}
