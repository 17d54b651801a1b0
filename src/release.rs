//! Deferred release of graphics buffers.
//!
//! A graphics buffer in flight between processes is not torn down when its
//! consumer unregisters it. Instead an owned copy of the handle is queued to
//! a single worker thread, which waits out the release delay and then runs
//! the ordinary unregistration on the copy. The caller gets a
//! [`ReleaseTicket`] that receives the copy once it has been torn down.
//!
//! Scheduled releases are never cancelled. Dropping the worker drains the
//! queue, so every accepted release still runs after its delay.

use crate::error::{Error, Result};
use crate::handle::BufferHandle;
use crate::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "gralloc-release";

struct Task {
    handle: BufferHandle,
    due: Instant,
    ticket: kanal::Sender<Result<BufferHandle>>,
}

enum Message {
    Release(Task),
    Shutdown,
}

/// Receives the torn-down copy of a deferred release.
pub struct ReleaseTicket {
    rx: kanal::Receiver<Result<BufferHandle>>,
}

impl std::fmt::Debug for ReleaseTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseTicket").finish_non_exhaustive()
    }
}

impl ReleaseTicket {
    fn closed() -> Error {
        Error::WorkerUnavailable("release worker dropped the ticket".into())
    }

    /// Block until the release has run.
    pub fn wait(self) -> Result<BufferHandle> {
        self.rx.recv().map_err(|_| Self::closed())?
    }

    /// Block for at most `timeout`. `None` if the release has not run yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<BufferHandle>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(kanal::ReceiveErrorTimeout::Timeout) => None,
            Err(_) => Some(Err(Self::closed())),
        }
    }

    /// Take the outcome if the release has already run.
    pub fn try_take(&self) -> Option<Result<BufferHandle>> {
        match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(_) => Some(Err(Self::closed())),
        }
    }
}

/// Outcome of an unregistration request.
#[derive(Debug)]
pub enum Unregistration {
    /// Torn down synchronously.
    Completed,
    /// Queued; the ticket observes the teardown.
    Deferred(ReleaseTicket),
}

impl Unregistration {
    /// True if the release was queued.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Unregistration::Deferred(_))
    }

    /// The ticket of a deferred release.
    pub fn into_ticket(self) -> Option<ReleaseTicket> {
        match self {
            Unregistration::Completed => None,
            Unregistration::Deferred(ticket) => Some(ticket),
        }
    }
}

/// Single-thread delayed release queue.
pub struct ReleaseWorker {
    tx: kanal::Sender<Message>,
    delay: Duration,
    pending: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl ReleaseWorker {
    /// Start the worker thread.
    pub fn spawn(registry: Arc<Registry>, delay: Duration) -> Result<Self> {
        let (tx, rx) = kanal::unbounded::<Message>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                tracing::debug!("release worker started");
                while let Ok(Message::Release(task)) = rx.recv() {
                    run_task(&registry, task);
                    worker_pending.fetch_sub(1, Ordering::AcqRel);
                }
                tracing::debug!("release worker stopped");
            })
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn release worker");
                Error::WorkerUnavailable(e.to_string())
            })?;

        Ok(Self {
            tx,
            delay,
            pending,
            thread: Some(thread),
        })
    }

    /// Delay applied to every release.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Releases queued or in progress.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue `handle` for unregistration after the delay.
    pub fn schedule(&self, handle: BufferHandle) -> Result<ReleaseTicket> {
        let (ticket_tx, ticket_rx) = kanal::bounded(1);
        let task = Task {
            handle,
            due: Instant::now() + self.delay,
            ticket: ticket_tx,
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Message::Release(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::error!("release worker queue closed");
            return Err(Error::WorkerUnavailable("release queue closed".into()));
        }
        Ok(ReleaseTicket { rx: ticket_rx })
    }
}

fn run_task(registry: &Registry, task: Task) {
    let Task {
        mut handle,
        due,
        ticket,
    } = task;
    let wait = due.saturating_duration_since(Instant::now());
    if !wait.is_zero() {
        std::thread::sleep(wait);
    }

    let outcome = match registry.unregister(&mut handle) {
        Ok(()) => {
            tracing::debug!(
                backing = handle.backing.name(),
                secure_id = handle.secure_id(),
                "deferred release done"
            );
            Ok(handle)
        }
        Err(e) => {
            tracing::error!(error = %e, "deferred release failed");
            Err(e)
        }
    };
    // Nobody may be holding the ticket any more.
    let _ = ticket.try_send(outcome);
}

impl Drop for ReleaseWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("release worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for ReleaseWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseWorker")
            .field("delay", &self.delay)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handle::Sharing;
    use crate::memory::{EmulatedIon, EmulatedSubsystem};

    fn setup() -> (Arc<EmulatedSubsystem>, Arc<Registry>) {
        let ump = Arc::new(EmulatedSubsystem::new());
        let registry = Arc::new(Registry::new(
            Config::default(),
            ump.clone(),
            Arc::new(EmulatedIon::new()),
        ));
        (ump, registry)
    }

    #[test]
    fn test_release_runs_after_delay() {
        let (ump, registry) = setup();
        ump.allocate_with_id(7, 4096).unwrap();
        let mut handle = BufferHandle::shared_memory(7, 4096).with_sharing(Sharing::GraphicBuffer);
        registry.register(&mut handle).unwrap();

        let worker = ReleaseWorker::spawn(Arc::clone(&registry), Duration::from_millis(50)).unwrap();
        let started = Instant::now();
        let ticket = worker.schedule(handle.clone()).unwrap();

        let released = ticket.wait().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(released.base, 0);
        assert!(handle.is_mapped());
        assert_eq!(ump.live_references(7), 0);
    }

    #[test]
    fn test_ticket_empty_before_delay() {
        let (ump, registry) = setup();
        ump.allocate_with_id(8, 4096).unwrap();
        let mut handle = BufferHandle::shared_memory(8, 4096);
        registry.register(&mut handle).unwrap();

        let worker = ReleaseWorker::spawn(Arc::clone(&registry), Duration::from_millis(500)).unwrap();
        let ticket = worker.schedule(handle).unwrap();
        assert!(ticket.try_take().is_none());
        assert_eq!(worker.pending(), 1);
        assert!(ticket.wait_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }

    #[test]
    fn test_failed_release_reported_on_ticket() {
        let (_ump, registry) = setup();
        let mut handle = BufferHandle::shared_memory(9, 4096);
        handle.magic = 0;

        let worker = ReleaseWorker::spawn(registry, Duration::ZERO).unwrap();
        let ticket = worker.schedule(handle).unwrap();
        assert!(matches!(ticket.wait(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_drop_drains_queue() {
        let (ump, registry) = setup();
        ump.allocate_with_id(10, 4096).unwrap();
        let mut handle = BufferHandle::shared_memory(10, 4096);
        registry.register(&mut handle).unwrap();

        let worker = ReleaseWorker::spawn(Arc::clone(&registry), Duration::from_millis(20)).unwrap();
        let ticket = worker.schedule(handle).unwrap();
        drop(worker);
        assert_eq!(ump.live_references(10), 0);
        assert!(ticket.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_worker_thread_name() {
        let (_ump, registry) = setup();
        let worker = ReleaseWorker::spawn(registry, Duration::ZERO).unwrap();
        let name = worker
            .thread
            .as_ref()
            .and_then(|t| t.thread().name().map(str::to_owned));
        assert_eq!(name.as_deref(), Some(WORKER_THREAD_NAME));
    }
}
