//! Transfer job orchestration.
//!
//! [`Orchestrator::run`] submits one task per descriptor to a fixed-size rayon
//! pool and then becomes the single consumer of the progress channel. All
//! slot bookkeeping, the job-wide counter and the result lists live on the
//! calling thread; workers only ever send events.
//!
//! The loop ends once every submitted task has returned and the channel has
//! been drained. A quiet channel on its own never ends the job.

use crate::config::TransferConfig;
use crate::display::ProgressView;
use crate::download::DownloadWorker;
use crate::logger::Logger;
use crate::progress::{ProgressEvent, Publisher, PublisherId, SlotTable};
use crate::types::{AggregationMode, TransferDescriptor, TransferResult};
use crate::upload::UploadWorker;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-descriptor transfer logic run on a pool thread.
///
/// Implementations must report through `publisher` and never panic on
/// runtime failures; a panic is still caught and reported as an error.
pub trait TransferWorker: Send + Sync + 'static {
    type Descriptor: Send + 'static;

    /// Label used for results when the worker never gets to run.
    fn source_of(&self, descriptor: &Self::Descriptor) -> String;

    fn transfer(&self, descriptor: Self::Descriptor, publisher: Publisher);
}

/// Routes mixed upload/download descriptors to the matching worker.
pub struct Dispatcher {
    pub upload: Option<UploadWorker>,
    pub download: Option<DownloadWorker>,
}

impl TransferWorker for Dispatcher {
    type Descriptor = TransferDescriptor;

    fn source_of(&self, descriptor: &TransferDescriptor) -> String {
        descriptor.source_label()
    }

    fn transfer(&self, descriptor: TransferDescriptor, publisher: Publisher) {
        match (descriptor, &self.upload, &self.download) {
            (TransferDescriptor::Upload(d), Some(worker), _) => worker.upload(d, publisher),
            (TransferDescriptor::Download(d), _, Some(worker)) => worker.download(d, publisher),
            (TransferDescriptor::Upload(_), None, _) => publisher.error("no upload worker configured"),
            (TransferDescriptor::Download(_), _, None) => publisher.error("no download worker configured"),
        }
    }
}

/// Stops tasks that have not started yet. In-flight transfers drain normally.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of one job: every descriptor lands in exactly one list.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub success: Vec<TransferResult>,
    pub failure: Vec<TransferResult>,
    pub aggregate: u64,
    pub elapsed: Duration,
}

impl JobReport {
    pub fn len(&self) -> usize {
        self.success.len() + self.failure.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_clean(&self) -> bool {
        self.failure.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.success.iter().filter(|r| r.is_skipped()).count()
    }
}

/// What one pull from the channel produced.
enum Pull {
    Event(ProgressEvent),
    /// Bounded wait ran out; re-check whether the job is done.
    Empty,
    Closed,
}

fn pull(rx: &Receiver<ProgressEvent>, wait: Duration) -> Pull {
    match rx.recv_timeout(wait) {
        Ok(event) => Pull::Event(event),
        Err(RecvTimeoutError::Timeout) => Pull::Empty,
        Err(RecvTimeoutError::Disconnected) => Pull::Closed,
    }
}

/// Consumer-side state. Only touched by the orchestrator thread.
struct JobState<'a> {
    slots: SlotTable,
    mode: AggregationMode,
    aggregate: u64,
    success: Vec<TransferResult>,
    failure: Vec<TransferResult>,
    retired: HashSet<PublisherId>,
    max_occupied: usize,
    logger: &'a dyn Logger,
    view: &'a mut dyn ProgressView,
}

impl<'a> JobState<'a> {
    fn new(
        pool_size: usize,
        mode: AggregationMode,
        logger: &'a dyn Logger,
        view: &'a mut dyn ProgressView,
    ) -> Self {
        Self {
            slots: SlotTable::new(pool_size),
            mode,
            aggregate: 0,
            success: Vec::new(),
            failure: Vec::new(),
            retired: HashSet::new(),
            max_occupied: 0,
            logger,
            view,
        }
    }

    fn apply(&mut self, event: ProgressEvent) {
        let publisher = event.publisher();
        if self.retired.contains(&publisher) {
            self.logger.error(
                "protocol",
                &publisher.to_string(),
                "event after terminal event ignored",
            );
            return;
        }

        match event {
            ProgressEvent::Initialize { total, name, .. } => {
                match self.slots.open(publisher, &name, total) {
                    Some(slot) => self.view.slot_opened(slot, &name, total),
                    None => self.logger.error("protocol", &name, "no display slot available"),
                }
                self.max_occupied = self.max_occupied.max(self.slots.occupied());
            }
            ProgressEvent::Progress { delta, .. } => {
                if let Some((slot, state)) = self.slots.advance(publisher, delta) {
                    self.view.slot_advanced(slot, state.done);
                }
                if self.mode == AggregationMode::ByteSum {
                    self.aggregate = self.aggregate.saturating_add(delta);
                    self.view.aggregate(self.aggregate);
                }
            }
            ProgressEvent::Finish {
                source,
                destination,
                metadata,
                ..
            } => {
                self.release(publisher, true);
                self.success.push(TransferResult::Success {
                    source,
                    destination,
                    metadata,
                    skipped: false,
                });
            }
            ProgressEvent::Skip {
                source,
                destination,
                reason,
                ..
            } => {
                self.release(publisher, true);
                self.view.note(&format!("skipped {source}: {reason}"));
                self.success.push(TransferResult::Success {
                    source,
                    destination,
                    metadata: Default::default(),
                    skipped: true,
                });
            }
            ProgressEvent::Error { source, error, .. } => {
                self.release(publisher, false);
                self.logger.error("transfer", &source, &error);
                self.view.note(&format!("failed {source}: {error}"));
                self.failure.push(TransferResult::Failure { source, error });
            }
        }
    }

    /// Retire a publisher. A publisher that never got a slot is fine.
    fn release(&mut self, publisher: PublisherId, counts: bool) {
        self.retired.insert(publisher);
        if let Some((slot, _)) = self.slots.close(publisher) {
            self.view.slot_closed(slot);
        }
        if counts && self.mode == AggregationMode::ItemCount {
            self.aggregate += 1;
            self.view.aggregate(self.aggregate);
        }
    }
}

pub struct Orchestrator {
    pool_size: usize,
    poll_interval: Duration,
    mode: AggregationMode,
    logger: Arc<dyn Logger>,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(pool_size: usize, mode: AggregationMode, logger: Arc<dyn Logger>) -> Self {
        Self {
            pool_size: pool_size.max(1),
            poll_interval: Duration::from_secs(3),
            mode,
            logger,
            cancel: CancelHandle::default(),
        }
    }

    pub fn from_config(config: &TransferConfig, mode: AggregationMode, logger: Arc<dyn Logger>) -> Self {
        Self::new(config.pool_size, mode, logger).poll_interval(config.poll_interval())
    }

    /// Longest single wait on the progress channel.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn run<W: TransferWorker>(
        &self,
        items: Vec<W::Descriptor>,
        worker: Arc<W>,
        view: &mut dyn ProgressView,
    ) -> Result<JobReport> {
        self.run_with_tap(items, worker, view, |_| {})
    }

    /// Like [`run`](Self::run), calling `tap` with every event before the
    /// orchestrator applies it.
    pub fn run_with_tap<W, F>(
        &self,
        items: Vec<W::Descriptor>,
        worker: Arc<W>,
        view: &mut dyn ProgressView,
        mut tap: F,
    ) -> Result<JobReport>
    where
        W: TransferWorker,
        F: FnMut(&ProgressEvent),
    {
        let start = Instant::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.pool_size)
            .thread_name(|i| format!("ferry-worker-{i}"))
            .build()
            .context("Failed to start transfer worker pool")?;

        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let completed = Arc::new(AtomicUsize::new(0));
        let submitted = items.len();

        for item in items {
            let worker = Arc::clone(&worker);
            let tx = tx.clone();
            let completed = Arc::clone(&completed);
            let cancel = self.cancel.clone();
            pool.spawn(move || {
                let publisher = Publisher::new(tx, worker.source_of(&item));
                if cancel.is_cancelled() {
                    publisher.error("cancelled before start");
                } else {
                    // Publisher's drop reports the failure if this unwinds.
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| worker.transfer(item, publisher)));
                }
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(tx);

        let mut state = JobState::new(self.pool_size, self.mode, self.logger.as_ref(), view);
        loop {
            if completed.load(Ordering::SeqCst) == submitted {
                // Every task has returned, so everything it sent is queued.
                for event in rx.try_iter() {
                    tap(&event);
                    state.apply(event);
                }
                break;
            }
            match pull(&rx, self.poll_interval) {
                Pull::Event(event) => {
                    tap(&event);
                    state.apply(event);
                }
                Pull::Empty => {}
                Pull::Closed => break,
            }
        }

        let report = JobReport {
            success: state.success,
            failure: state.failure,
            aggregate: state.aggregate,
            elapsed: start.elapsed(),
        };
        debug_assert!(state.max_occupied <= self.pool_size);
        self.logger.done(
            report.success.len(),
            report.failure.len(),
            report.aggregate,
            report.elapsed.as_secs_f64(),
        );
        view.finish(&report);
        Ok(report)
    }
}
