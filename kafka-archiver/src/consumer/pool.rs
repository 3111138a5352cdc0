use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use tracing::{error, info};

use crate::consumer::worker::{ConsumerWorker, WorkerHandle, WorkerSettings};
use crate::kafka::client::BrokerClient;
use crate::kafka::types::ConsumerId;
use crate::writer::coordinator::WriteCoordinator;

struct RunningWorker {
    handle: WorkerHandle,
    thread: JoinHandle<Result<()>>,
}

/// N consumer workers, each on its own named thread with its own broker client.
pub struct ConsumerPool {
    workers: Vec<RunningWorker>,
}

impl ConsumerPool {
    /// Creates `count` clients through `create_client` on the calling thread and starts a worker
    /// for each. When any client cannot be created the workers already started are shut down
    /// and the error is returned.
    pub fn start<C, F>(
        count: usize,
        coordinator: Arc<WriteCoordinator>,
        settings: WorkerSettings,
        mut create_client: F,
    ) -> Result<Self>
    where
        C: BrokerClient + 'static,
        F: FnMut(ConsumerId) -> Result<C>,
    {
        let mut pool = Self {
            workers: Vec::with_capacity(count),
        };

        for consumer_id in 0..count {
            if let Err(e) = pool.spawn_worker(
                consumer_id,
                &coordinator,
                &settings,
                &mut create_client,
            ) {
                error!(consumer_id, "Failed to start consumer worker: {e:#}");
                pool.shutdown();
                return Err(e);
            }
        }

        info!("Started {} consumer workers", count);
        Ok(pool)
    }

    fn spawn_worker<C, F>(
        &mut self,
        consumer_id: ConsumerId,
        coordinator: &Arc<WriteCoordinator>,
        settings: &WorkerSettings,
        create_client: &mut F,
    ) -> Result<()>
    where
        C: BrokerClient + 'static,
        F: FnMut(ConsumerId) -> Result<C>,
    {
        let client = create_client(consumer_id)
            .with_context(|| format!("Failed to create broker client for consumer {consumer_id}"))?;
        let worker =
            ConsumerWorker::new(consumer_id, client, coordinator.clone(), settings.clone());
        let handle = worker.handle();

        let thread = thread::Builder::new()
            .name(format!("consumer-worker-{consumer_id}"))
            .spawn(move || worker.run())
            .with_context(|| format!("Failed to spawn thread for consumer {consumer_id}"))?;

        self.workers.push(RunningWorker { handle, thread });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// True while every worker thread is still running
    pub fn is_healthy(&self) -> bool {
        self.workers.iter().all(|w| !w.thread.is_finished())
    }

    /// Stops every worker, then waits for all of them to close. Returns each worker's outcome
    /// in consumer id order.
    pub fn shutdown(self) -> Vec<Result<()>> {
        info!("Stopping {} consumer workers", self.workers.len());
        for worker in &self.workers {
            worker.handle.stop();
        }

        self.workers
            .into_iter()
            .map(|worker| {
                let consumer_id = worker.handle.consumer_id();
                let outcome = worker
                    .thread
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("consumer worker {consumer_id} panicked")));
                match &outcome {
                    Ok(()) => info!(consumer_id, "Consumer worker stopped"),
                    Err(e) => error!(consumer_id, "Consumer worker stopped with error: {e:#}"),
                }
                outcome
            })
            .collect()
    }
}
