//! In-process transport straight into an [`Executor`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{Transport, TransportError};
use crate::executor::Executor;
use crate::protocol::{ProgressEvent, Reply, Request};

/// Each call runs on its own task, so a caller that stops waiting (timeout)
/// never cancels the work on the executor side.
#[derive(Clone)]
pub struct LocalTransport {
    executor: Arc<Executor>,
}

impl LocalTransport {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: Request) -> Result<Reply, TransportError> {
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move { executor.handle(request).await })
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.executor.subscribe()
    }
}
