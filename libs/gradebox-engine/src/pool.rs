// Bounded worker pool in front of the execution engine.
//
// Requests go onto a bounded mpsc queue; N workers pull from it and run one
// request at a time. Every queued or running request has a cancellation
// token registered under its id until its result is delivered.

use crate::error::EngineError;
use crate::orchestrator::ExecutionEngine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gradebox_common::types::{CallerRole, ExecutionRequest, ExecutionResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Job {
    request: ExecutionRequest,
    caller: CallerRole,
    cancel: CancellationToken,
    reply: oneshot::Sender<ExecutionResult>,
}

/// A request accepted onto the queue.
pub struct Submission {
    pub request_id: Uuid,
    pub cancel: CancellationToken,
    reply: oneshot::Receiver<ExecutionResult>,
}

impl Submission {
    pub async fn wait(self) -> Result<ExecutionResult, EngineError> {
        self.reply.await.map_err(|_| EngineError::WorkerLost)
    }
}

pub struct WorkerPool {
    engine: Arc<ExecutionEngine>,
    sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    cancels: Arc<DashMap<Uuid, CancellationToken>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(engine: Arc<ExecutionEngine>, workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let cancels = Arc::new(DashMap::new());

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    engine.clone(),
                    rx.clone(),
                    cancels.clone(),
                ))
            })
            .collect();

        info!(workers = workers.max(1), queue_capacity, "Worker pool started");
        Self {
            engine,
            sender: std::sync::Mutex::new(Some(tx)),
            cancels,
            workers: Mutex::new(handles),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Queue a request without waiting for it. Fails fast when the queue is
    /// full or the pool is shutting down.
    pub fn submit(
        &self,
        request: ExecutionRequest,
        caller: CallerRole,
    ) -> Result<Submission, EngineError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| EngineError::ShuttingDown)?
            .clone()
            .ok_or(EngineError::ShuttingDown)?;

        let request_id = request.id;
        let cancel = CancellationToken::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.cancels.entry(request_id) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateRequest(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        let job = Job {
            request,
            caller,
            cancel: cancel.clone(),
            reply: reply_tx,
        };
        match sender.try_send(job) {
            Ok(()) => {
                debug!(request_id = %request_id, "Request queued");
                Ok(Submission {
                    request_id,
                    cancel,
                    reply: reply_rx,
                })
            }
            Err(err) => {
                self.cancels.remove(&request_id);
                Err(match err {
                    mpsc::error::TrySendError::Full(_) => EngineError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => EngineError::ShuttingDown,
                })
            }
        }
    }

    /// Queue a request and wait for its result. Dropping the returned future
    /// (a disconnected client) cancels the request.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        caller: CallerRole,
    ) -> Result<ExecutionResult, EngineError> {
        let submission = self.submit(request, caller)?;
        let guard = submission.cancel.clone().drop_guard();
        let result = submission.wait().await;
        guard.disarm();
        result
    }

    /// Cancel a queued or running request. False when the id is unknown or
    /// already finished.
    pub fn cancel(&self, request_id: &Uuid) -> bool {
        match self.cancels.get(request_id) {
            Some(token) => {
                token.cancel();
                info!(request_id = %request_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.cancels.len()
    }

    /// Stop accepting work, let queued requests finish, and wait for the
    /// workers. Past `timeout`, everything still in flight is cancelled.
    pub async fn shutdown(&self, timeout: Duration) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let joined = futures_util::future::join_all(handles);
        tokio::pin!(joined);

        if tokio::time::timeout(timeout, joined.as_mut()).await.is_err() {
            warn!(
                in_flight = self.cancels.len(),
                "Pool drain timed out; cancelling remaining requests"
            );
            for entry in self.cancels.iter() {
                entry.value().cancel();
            }
            joined.await;
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    engine: Arc<ExecutionEngine>,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    cancels: Arc<DashMap<Uuid, CancellationToken>>,
) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let request_id = job.request.id;
        debug!(worker_id, request_id = %request_id, "Worker picked up request");
        let result = engine.execute(&job.request, job.caller, &job.cancel).await;
        cancels.remove(&request_id);

        if job.reply.send(result).is_err() {
            debug!(request_id = %request_id, "Caller went away before the result was ready");
        }
    }
    debug!(worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LanguageRegistry;
    use crate::sandbox::fake::{FakeProvisioner, FakeStep};
    use crate::sandbox::ExecOutcome;
    use gradebox_common::config::EngineConfig;
    use gradebox_common::types::{CaseVerdict, SecurityLevel, TestCase};

    fn pool_with(fake: Arc<FakeProvisioner>, workers: usize, capacity: usize) -> WorkerPool {
        let registry = Arc::new(LanguageRegistry::builtin().unwrap());
        let engine = Arc::new(ExecutionEngine::new(&EngineConfig::default(), registry, fake));
        WorkerPool::start(engine, workers, capacity)
    }

    fn request(input: &str) -> ExecutionRequest {
        ExecutionRequest {
            id: Uuid::new_v4(),
            language: "python".to_string(),
            source_code: "print(input())\n".to_string(),
            test_cases: vec![TestCase {
                id: "1".to_string(),
                input: input.to_string(),
                expected_output: input.to_string(),
                is_hidden: false,
                weight: 1.0,
            }],
            resource_limits: None,
            security_level: SecurityLevel::High,
        }
    }

    fn hang_on(marker: &'static str) -> FakeProvisioner {
        FakeProvisioner::new(move |spec| {
            if spec.stdin == marker {
                FakeStep::Hang
            } else {
                FakeStep::Done(ExecOutcome::exited(0, spec.stdin.clone(), ""))
            }
        })
    }

    #[tokio::test]
    async fn test_executes_through_the_queue() {
        let fake = Arc::new(FakeProvisioner::echo());
        let pool = pool_with(fake.clone(), 2, 8);

        let result = pool.execute(request("hi"), CallerRole::Candidate).await.unwrap();
        assert!(result.success);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(fake.released(), 1);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let fake = Arc::new(hang_on("hang"));
        let pool = pool_with(fake, 1, 1);

        let running = pool.submit(request("hang"), CallerRole::Candidate).unwrap();
        // let the single worker pick it up
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = pool.submit(request("hang"), CallerRole::Candidate).unwrap();
        assert!(matches!(
            pool.submit(request("x"), CallerRole::Candidate),
            Err(EngineError::QueueFull)
        ));

        assert!(pool.cancel(&running.request_id));
        assert!(pool.cancel(&queued.request_id));
        assert!(running.wait().await.unwrap().cancelled);
        assert!(queued.wait().await.unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_in_flight_id() {
        let fake = Arc::new(hang_on("hang"));
        let pool = pool_with(fake, 1, 4);

        let first = request("hang");
        let mut second = request("x");
        second.id = first.id;

        let submission = pool.submit(first, CallerRole::Candidate).unwrap();
        assert!(matches!(
            pool.submit(second, CallerRole::Candidate),
            Err(EngineError::DuplicateRequest(id)) if id == submission.request_id
        ));

        pool.cancel(&submission.request_id);
        assert!(submission.wait().await.unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_cancel_by_id() {
        let fake = Arc::new(hang_on("hang"));
        let pool = pool_with(fake.clone(), 1, 4);

        let submission = pool.submit(request("hang"), CallerRole::Candidate).unwrap();
        let id = submission.request_id;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.cancel(&id));

        let result = submission.wait().await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.test_results[0].verdict, CaseVerdict::NotRun);
        assert!(!pool.cancel(&id));
        assert_eq!(fake.acquired(), fake.released());
    }

    #[tokio::test]
    async fn test_dropping_the_caller_cancels() {
        let fake = Arc::new(hang_on("hang"));
        let pool = Arc::new(pool_with(fake.clone(), 1, 4));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(request("hang"), CallerRole::Candidate).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        waiter.abort();
        let _ = waiter.await;

        // the worker finishes the cancelled request and frees its sandbox
        for _ in 0..100 {
            if fake.released() == 1 && pool.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fake.released(), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let fake = Arc::new(FakeProvisioner::echo());
        let pool = pool_with(fake.clone(), 2, 8);

        let submission = pool.submit(request("a"), CallerRole::Candidate).unwrap();
        pool.shutdown(Duration::from_secs(5)).await;
        assert!(submission.wait().await.unwrap().success);

        assert!(matches!(
            pool.submit(request("b"), CallerRole::Candidate),
            Err(EngineError::ShuttingDown)
        ));
    }
}
