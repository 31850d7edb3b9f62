//! Request/response protocol between the caller and an isolated worker.
//!
//! A worker runs on its own OS thread and owns all of its state. Callers hold a
//! [`WorkerHandle`] which tags every request with a correlation id, parks a
//! continuation in a [`PendingTable`] and waits for the matching reply under a
//! deadline. A dispatcher task routes replies back to their continuations.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::ids;

pub type CorrelationId = String;

/// Errors observed by a caller waiting on a worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
  /// No reply arrived before the deadline
  #[error("{worker} worker timed out after {timeout:?}")]
  Timeout {
    worker: &'static str,
    timeout: Duration,
  },
  /// The worker died; every pending request is failed with this
  #[error("{worker} worker failed: {reason}")]
  WorkerFailure {
    worker: &'static str,
    reason: String,
  },
  /// The task itself reported an error; the worker keeps running
  #[error("task failed: {0}")]
  Task(String),
  /// The handle was terminated by its owner
  #[error("{0} worker was terminated")]
  Terminated(&'static str),
}

/// Error returned by [`Worker::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  /// The task failed; report it and keep serving
  Failed(String),
  /// The worker cannot continue; stop the worker
  Fatal(String),
}

impl From<String> for TaskError {
  fn from(message: String) -> Self {
    Self::Failed(message)
  }
}

/// A state machine that runs in its own execution context, one message at a time.
pub trait Worker: Send + 'static {
  type Request: Send + 'static;
  type Response: Send + 'static;

  /// Name used in logs and errors.
  const NAME: &'static str;

  fn handle(&mut self, request: Self::Request) -> Result<Self::Response, TaskError>;
}

/// A request on its way to the worker.
#[derive(Debug)]
pub struct Envelope<Req> {
  pub id: CorrelationId,
  pub request: Req,
}

/// A reply on its way back from the worker.
#[derive(Debug)]
pub struct Reply<Resp> {
  pub id: CorrelationId,
  pub outcome: Result<Resp, String>,
}

enum Inbound<Req> {
  Call(Envelope<Req>),
  Shutdown,
}

enum Outbound<Resp> {
  Reply(Reply<Resp>),
  Crashed(String),
}

struct Pending<R> {
  issued_at: Instant,
  tx: oneshot::Sender<Result<R, WorkerError>>,
}

/// Continuations waiting for a reply, keyed by correlation id.
///
/// Each registered id is completed at most once: whichever of reply, timeout
/// or failure arrives first removes the entry and later arrivals find nothing.
pub struct PendingTable<R> {
  worker: &'static str,
  entries: Mutex<HashMap<CorrelationId, Pending<R>>>,
}

impl<R> PendingTable<R> {
  pub fn new(worker: &'static str) -> Self {
    Self {
      worker,
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, Pending<R>>> {
    // A poisoned table still holds valid senders
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Park a continuation for `id`.
  pub fn register(&self, id: &str) -> oneshot::Receiver<Result<R, WorkerError>> {
    let (tx, rx) = oneshot::channel();
    let pending = Pending {
      issued_at: Instant::now(),
      tx,
    };
    self.lock().insert(id.to_string(), pending);
    rx
  }

  /// Deliver an outcome. Returns false when nothing was waiting for `id`.
  pub fn complete(&self, id: &str, outcome: Result<R, WorkerError>) -> bool {
    let Some(pending) = self.lock().remove(id) else {
      tracing::warn!(worker = self.worker, correlation_id = %id, "Discarding reply with no pending request");
      return false;
    };
    tracing::trace!(
      worker = self.worker,
      correlation_id = %id,
      elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
      "Worker round trip complete"
    );
    // The caller may have stopped waiting; that is not an error here
    let _ = pending.tx.send(outcome);
    true
  }

  /// Forget `id` after its deadline passed.
  pub fn expire(&self, id: &str) -> bool {
    self.lock().remove(id).is_some()
  }

  /// Fail every pending continuation and clear the table.
  pub fn fail_all(&self, error: WorkerError) -> usize {
    let drained: Vec<Pending<R>> = self.lock().drain().map(|(_, p)| p).collect();
    let count = drained.len();
    for pending in drained {
      let _ = pending.tx.send(Err(error.clone()));
    }
    count
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Caller-owned handle to a running worker.
pub struct WorkerHandle<W: Worker> {
  inbox: mpsc::UnboundedSender<Inbound<W::Request>>,
  pending: Arc<PendingTable<W::Response>>,
  alive: Arc<AtomicBool>,
  timeout: Duration,
}

impl<W: Worker> Clone for WorkerHandle<W> {
  fn clone(&self) -> Self {
    Self {
      inbox: self.inbox.clone(),
      pending: Arc::clone(&self.pending),
      alive: Arc::clone(&self.alive),
      timeout: self.timeout,
    }
  }
}

impl<W: Worker> WorkerHandle<W> {
  /// Start `worker` on a dedicated thread. Must be called inside a tokio runtime.
  pub fn spawn(worker: W, timeout: Duration) -> color_eyre::Result<Self> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(PendingTable::new(W::NAME));
    let alive = Arc::new(AtomicBool::new(true));

    std::thread::Builder::new()
      .name(format!("{}-worker", W::NAME))
      .spawn(move || run_worker(worker, inbox_rx, outbox_tx))
      .map_err(|e| color_eyre::eyre::eyre!("Failed to start {} worker: {}", W::NAME, e))?;

    tokio::spawn(dispatch_replies::<W>(
      outbox_rx,
      Arc::clone(&pending),
      Arc::clone(&alive),
    ));

    tracing::debug!(worker = W::NAME, ?timeout, "Worker started");

    Ok(Self {
      inbox: inbox_tx,
      pending,
      alive,
      timeout,
    })
  }

  /// Send a request and wait for its reply using the handle's default deadline.
  pub async fn call(&self, request: W::Request) -> Result<W::Response, WorkerError> {
    self.call_with_timeout(request, self.timeout).await
  }

  pub async fn call_with_timeout(
    &self,
    request: W::Request,
    timeout: Duration,
  ) -> Result<W::Response, WorkerError> {
    if !self.is_alive() {
      return Err(self.failure("worker is not running"));
    }

    let id = ids::generate("msg");
    let rx = self.pending.register(&id);

    let envelope = Envelope {
      id: id.clone(),
      request,
    };
    if self.inbox.send(Inbound::Call(envelope)).is_err() {
      self.pending.expire(&id);
      return Err(self.failure("inbox closed"));
    }

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(_)) => Err(self.failure("continuation dropped")),
      Err(_) => {
        self.pending.expire(&id);
        tracing::warn!(worker = W::NAME, correlation_id = %id, ?timeout, "Worker request timed out");
        Err(WorkerError::Timeout {
          worker: W::NAME,
          timeout,
        })
      }
    }
  }

  /// Stop the worker and fail everything still waiting on it.
  pub fn terminate(&self) {
    let failed = self.pending.fail_all(WorkerError::Terminated(W::NAME));
    self.alive.store(false, Ordering::SeqCst);
    let _ = self.inbox.send(Inbound::Shutdown);
    tracing::debug!(worker = W::NAME, failed, "Worker terminated");
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  fn failure(&self, reason: &str) -> WorkerError {
    WorkerError::WorkerFailure {
      worker: W::NAME,
      reason: reason.to_string(),
    }
  }
}

fn run_worker<W: Worker>(
  mut worker: W,
  mut inbox: mpsc::UnboundedReceiver<Inbound<W::Request>>,
  outbox: mpsc::UnboundedSender<Outbound<W::Response>>,
) {
  while let Some(message) = inbox.blocking_recv() {
    let Envelope { id, request } = match message {
      Inbound::Call(envelope) => envelope,
      Inbound::Shutdown => break,
    };

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| worker.handle(request))) {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(TaskError::Failed(message))) => Err(message),
      Ok(Err(TaskError::Fatal(reason))) => {
        tracing::error!(worker = W::NAME, %reason, "Worker stopping after fatal error");
        let _ = outbox.send(Outbound::Crashed(reason));
        return;
      }
      Err(payload) => Err(panic_message(payload.as_ref())),
    };

    if outbox.send(Outbound::Reply(Reply { id, outcome })).is_err() {
      break;
    }
  }
}

async fn dispatch_replies<W: Worker>(
  mut outbox: mpsc::UnboundedReceiver<Outbound<W::Response>>,
  pending: Arc<PendingTable<W::Response>>,
  alive: Arc<AtomicBool>,
) {
  let mut reason = "worker exited".to_string();

  while let Some(message) = outbox.recv().await {
    match message {
      Outbound::Reply(Reply { id, outcome }) => {
        pending.complete(&id, outcome.map_err(WorkerError::Task));
      }
      Outbound::Crashed(why) => {
        reason = why;
        break;
      }
    }
  }

  alive.store(false, Ordering::SeqCst);
  let failed = pending.fail_all(WorkerError::WorkerFailure {
    worker: W::NAME,
    reason: reason.clone(),
  });
  if failed > 0 {
    tracing::error!(worker = W::NAME, failed, %reason, "Worker failure rejected pending requests");
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "worker task panicked".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Echoes numbers; fails on negatives, panics on zero, dies on 999.
  struct EchoWorker {
    handled: usize,
  }

  impl Worker for EchoWorker {
    type Request = i64;
    type Response = (i64, usize);
    const NAME: &'static str = "echo";

    fn handle(&mut self, request: i64) -> Result<(i64, usize), TaskError> {
      self.handled += 1;
      match request {
        999 => Err(TaskError::Fatal("storage corrupt".into())),
        0 => panic!("zero is not allowed"),
        n if n < 0 => Err(TaskError::Failed(format!("negative: {}", n))),
        n => Ok((n, self.handled)),
      }
    }
  }

  /// Never answers, holding requests until shutdown.
  struct SilentWorker;

  impl Worker for SilentWorker {
    type Request = ();
    type Response = ();
    const NAME: &'static str = "silent";

    fn handle(&mut self, _request: ()) -> Result<(), TaskError> {
      std::thread::sleep(Duration::from_millis(300));
      Ok(())
    }
  }

  fn echo() -> WorkerHandle<EchoWorker> {
    WorkerHandle::spawn(EchoWorker { handled: 0 }, Duration::from_secs(5)).unwrap()
  }

  #[tokio::test]
  async fn test_round_trip() {
    let handle = echo();
    assert_eq!(handle.call(7).await.unwrap(), (7, 1));
    assert_eq!(handle.call(8).await.unwrap(), (8, 2));
    assert!(handle.pending.is_empty());
  }

  #[tokio::test]
  async fn test_task_error_does_not_stop_worker() {
    let handle = echo();
    let err = handle.call(-1).await.unwrap_err();
    assert_eq!(err, WorkerError::Task("negative: -1".into()));

    let err = handle.call(0).await.unwrap_err();
    assert!(matches!(err, WorkerError::Task(ref m) if m.contains("zero")));

    // Same instance keeps its state and keeps serving
    assert_eq!(handle.call(5).await.unwrap(), (5, 3));
  }

  #[tokio::test]
  async fn test_fatal_error_fails_worker() {
    let handle = echo();
    let err = handle.call(999).await.unwrap_err();
    assert!(matches!(err, WorkerError::WorkerFailure { ref reason, .. } if reason == "storage corrupt"));

    // Give the dispatcher a moment to mark the handle dead
    for _ in 0..50 {
      if !handle.is_alive() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!handle.is_alive());
    assert!(matches!(
      handle.call(1).await,
      Err(WorkerError::WorkerFailure { .. })
    ));
  }

  #[tokio::test]
  async fn test_timeout_removes_pending_entry() {
    let handle = WorkerHandle::spawn(SilentWorker, Duration::from_millis(20)).unwrap();
    let err = handle.call(()).await.unwrap_err();
    assert!(matches!(err, WorkerError::Timeout { worker: "silent", .. }));
    assert_eq!(handle.pending_count(), 0);
    // The late reply arrives after this and is discarded by the dispatcher
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(handle.pending_count(), 0);
    assert!(handle.is_alive());
  }

  #[tokio::test]
  async fn test_terminate_rejects_pending_requests() {
    let handle = WorkerHandle::spawn(SilentWorker, Duration::from_secs(5)).unwrap();
    let waiter = {
      let handle = handle.clone();
      tokio::spawn(async move { handle.call(()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.terminate();
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err, WorkerError::Terminated("silent"));
    assert!(!handle.is_alive());
  }

  #[test]
  fn test_late_reply_after_timeout_is_discarded() {
    let table: PendingTable<u32> = PendingTable::new("test");
    let mut rx = table.register("abc");
    assert!(table.expire("abc"));
    assert!(!table.complete("abc", Ok(1)));
    // Nothing was ever delivered to the continuation
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_complete_is_single_shot() {
    let table: PendingTable<u32> = PendingTable::new("test");
    let mut rx = table.register("abc");
    assert!(table.complete("abc", Ok(1)));
    assert!(!table.complete("abc", Ok(2)));
    assert_eq!(rx.try_recv().unwrap(), Ok(1));
  }

  #[test]
  fn test_fail_all_clears_table() {
    let table: PendingTable<u32> = PendingTable::new("test");
    let mut a = table.register("a");
    let mut b = table.register("b");
    let err = WorkerError::WorkerFailure {
      worker: "test",
      reason: "crash".into(),
    };
    assert_eq!(table.fail_all(err.clone()), 2);
    assert!(table.is_empty());
    assert_eq!(a.try_recv().unwrap(), Err(err.clone()));
    assert_eq!(b.try_recv().unwrap(), Err(err));
  }
}
