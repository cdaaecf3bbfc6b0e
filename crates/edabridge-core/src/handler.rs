//! Inbound request dispatch.
//!
//! Every request observed on a connection gets exactly one response, even if
//! the handler fails or panics. [`respond`] is the only place that turns a
//! handler outcome into a response frame.

use crate::{ErrorBody, Message, codes};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

/// Error returned by a request handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Defaults to `INTERNAL_ERROR` when the handler does not pick one.
    pub code: Option<String>,
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::INVALID_PARAMS)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(format!("unknown method: {method}")).with_code(codes::METHOD_NOT_FOUND)
    }

    fn into_body(self) -> ErrorBody {
        ErrorBody {
            code: self.code.unwrap_or_else(|| codes::INTERNAL_ERROR.to_string()),
            message: self.message,
            data: self.data,
        }
    }
}

/// Serves inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError>;
}

/// Run a handler and build the single response for request `id`.
pub async fn respond(
    handler: &dyn RequestHandler,
    id: String,
    method: &str,
    params: Option<Value>,
) -> Message {
    let outcome = AssertUnwindSafe(handler.handle(method, params))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(result)) => Message::success(id, result),
        Ok(Err(err)) => {
            tracing::debug!("Handler for {} failed: {}", method, err);
            Message::failure(id, err.into_body())
        }
        Err(_) => {
            tracing::warn!("Handler for {} panicked", method);
            Message::failure(
                id,
                ErrorBody::new(codes::INTERNAL_ERROR, format!("handler for {method} panicked")),
            )
        }
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
type Route = Arc<dyn Fn(Option<Value>) -> BoxFuture + Send + Sync>;

/// Routes requests to closures by method name.
///
/// Unknown methods answer `METHOD_NOT_FOUND`.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `method`, replacing any previous one.
    pub fn route<F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.routes
            .insert(method.into(), Arc::new(move |params| Box::pin(f(params))));
        self
    }

    pub fn has_route(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.methods().collect();
        methods.sort_unstable();
        f.debug_struct("Router").field("methods", &methods).finish()
    }
}

#[async_trait]
impl RequestHandler for Router {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError> {
        match self.routes.get(method) {
            Some(route) => route(params).await,
            None => Err(HandlerError::method_not_found(method)),
        }
    }
}
