use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use crate::io_port::{Completion, CompletionQueue};

/// Consumer of completions. Completions for the same connection may be handled concurrently by
///  different workers and in any order, so implementations must serialize per connection.
pub trait CompletionHandler: Send + Sync + 'static {
    fn handle_completion(&self, completion: Completion);
}

/// A fixed pool of workers that take completions off the shared queue and hand them to the
///  handler. Any worker may pick up any completion; there is no ordering between them.
///
/// Workers run until the dispatcher is shut down or dropped.
pub struct CompletionDispatcher {
    workers: Vec<JoinHandle<()>>,
}

impl CompletionDispatcher {
    pub fn spawn(queue: Arc<CompletionQueue>, handler: Arc<dyn CompletionHandler>, num_workers: usize) -> CompletionDispatcher {
        let workers = (0..num_workers)
            .map(|worker_id| {
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    Self::worker_loop(worker_id, queue, handler).await
                })
            })
            .collect();

        debug!("started {} completion workers", num_workers);
        CompletionDispatcher { workers }
    }

    async fn worker_loop(worker_id: usize, queue: Arc<CompletionQueue>, handler: Arc<dyn CompletionHandler>) {
        while let Some(completion) = queue.next().await {
            trace!("worker {}: handling {:?} completion", worker_id, completion.descriptor.kind());
            handler.handle_completion(completion);
        }
        debug!("worker {}: completion queue closed", worker_id);
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn shutdown(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl Drop for CompletionDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
