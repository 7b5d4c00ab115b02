//! Request/response collaborator.
//!
//! A [`Transport`] sends a request to a URL and returns the decoded
//! response. [`TaskBuilder::from_transport`] wraps one in a task whose
//! arguments are `(path, request)`; the path is appended to a base URL.

use std::sync::Arc;

use async_trait::async_trait;

use crate::task::{CallArgs, TaskBuilder, TaskOutput};

/// Something that can carry a request and bring back a response.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Request payload.
    type Request: CallArgs;
    /// Decoded response.
    type Output: TaskOutput;
    /// Transport failure, including non-success responses.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send `request` to `url`.
    async fn send(&self, url: &str, request: &Self::Request) -> Result<Self::Output, Self::Error>;
}

impl<Q: CallArgs, O: TaskOutput> TaskBuilder<(String, Q), O> {
    /// A task that sends its request through `transport`, to `base_url`
    /// followed by the path given at call time.
    pub fn from_transport<X>(transport: X, base_url: impl Into<String>) -> Self
    where
        X: Transport<Request = Q, Output = O>,
    {
        let transport = Arc::new(transport);
        let base_url: Arc<str> = base_url.into().into();
        TaskBuilder::new(move |(path, request): (String, Q)| {
            let transport = transport.clone();
            let url = format!("{base_url}{path}");
            async move {
                #[cfg(feature = "tracing")]
                tracing::debug!(url = %url, "transport.send");
                transport.send(&url, &request).await
            }
        })
    }
}
