//! Request dispatch: lookup, validation, invocation and failure translation.

use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::{
    ErrorKind, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::mcp::registry::HandlerRegistry;
use crate::mcp::session::RequestContext;
use crate::observe::{Event, EventSink};

/// Routes decoded messages to registered handlers.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    sink: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self { registry, sink }
    }

    async fn invoke(&self, method: &str, params: Value, ctx: RequestContext) -> Result<Value> {
        let entry = self
            .registry
            .get(method)
            .ok_or_else(|| Error::MethodNotFound(method.to_string()))?;

        entry
            .validator
            .validate(&params)
            .map_err(Error::InvalidParams)?;

        match AssertUnwindSafe(entry.handler.call(params, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!("Handler for {} panicked", method);
                Err(Error::Internal(format!("handler for {} panicked", method)))
            }
        }
    }

    /// Handle a request.
    ///
    /// Returns `None` if the request's cancellation token fired first; the
    /// canceller is then responsible for the response.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: RequestContext,
    ) -> Option<JsonRpcResponse> {
        debug!("Handling request: {} (id: {})", request.method, request.id);
        let started = Instant::now();
        let cancel = ctx.cancel.clone();
        let params = request.params.unwrap_or(Value::Null);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                metrics::counter!(
                    "doxie_requests_total",
                    "method" => request.method.clone(),
                    "outcome" => "cancelled"
                )
                .increment(1);
                return None;
            }
            result = self.invoke(&request.method, params, ctx) => result,
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        metrics::counter!(
            "doxie_requests_total",
            "method" => request.method.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("doxie_request_duration_seconds", "method" => request.method.clone())
            .record(started.elapsed().as_secs_f64());

        Some(match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => {
                debug!("Request {} ({}) failed: {}", request.id, request.method, e);
                JsonRpcResponse::failure(request.id, error_object(e))
            }
        })
    }

    /// Handle a notification. The outcome is never sent to the peer; failures
    /// are reported to the event sink.
    pub async fn handle_notification(&self, notification: JsonRpcNotification, ctx: RequestContext) {
        debug!("Handling notification: {}", notification.method);
        let session = ctx.session_id.clone();
        let params = notification.params.unwrap_or(Value::Null);

        if let Err(e) = self.invoke(&notification.method, params, ctx).await {
            warn!("Notification {} failed: {}", notification.method, e);
            self.sink.emit(Event::notification_failed(
                session,
                notification.method,
                e.kind(),
                e.to_string(),
            ));
        }
    }
}

/// Translate a failure into the error object sent to the peer.
pub fn error_object(error: Error) -> JsonRpcError {
    match error {
        Error::Handler { code, message } => JsonRpcError::handler(code, message, None),
        Error::MethodNotFound(method) => JsonRpcError::new(
            ErrorKind::MethodNotFound,
            format!("Method not found: {}", method),
        ),
        Error::InvalidParams(reason) => JsonRpcError::new(ErrorKind::InvalidParams, reason),
        Error::InvalidRequest(reason) => JsonRpcError::new(ErrorKind::InvalidRequest, reason),
        Error::Cancelled => JsonRpcError::new(ErrorKind::Cancelled, "Request cancelled"),
        Error::Internal(reason) => JsonRpcError::new(ErrorKind::Internal, reason),
        other => JsonRpcError::handler(
            crate::mcp::protocol::error_codes::HANDLER_ERROR,
            other.to_string(),
            None,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::registry::handler_fn;
    use crate::mcp::schema::{AnyInput, Schema};
    use crate::mcp::session::{Session, SessionId, SessionOptions};
    use crate::mcp::protocol::RequestId;
    use crate::mcp::transport::Connection;
    use crate::observe::MemorySink;
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "echo",
                Arc::new(Schema::new(json!({
                    "type": "object",
                    "properties": {"x": {"type": "integer"}},
                    "required": ["x"]
                }))),
                handler_fn(|params, _ctx| async move { Ok::<_, Error>(params) }),
            )
            .unwrap();
        registry
            .register(
                "fail",
                Arc::new(AnyInput),
                handler_fn(|_params, _ctx| async {
                    Err::<Value, _>(Error::handler(4242, "quota exceeded"))
                }),
            )
            .unwrap();
        registry
            .register(
                "panic",
                Arc::new(AnyInput),
                handler_fn(|_params, _ctx| async {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<_, Error>(Value::Null)
                }),
            )
            .unwrap();
        registry
    }

    /// A dispatcher plus a live request context to call it with.
    fn setup() -> (Dispatcher, RequestContext, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let registry = Arc::new(registry());
        let dispatcher = Dispatcher::new(registry.clone(), sink.clone());

        let (connection, _inbound, _queue) = Connection::pair(SessionId::from("test"), 4);
        let (_session, handle) = Session::new(
            connection,
            Arc::new(Dispatcher::new(registry, sink.clone())),
            SessionOptions::default(),
            sink.clone(),
        );
        let ctx = handle.context_for(Some(RequestId::Number(1)));
        (dispatcher, ctx, sink)
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(RequestId::Number(1), method, Some(params))
    }

    #[tokio::test]
    async fn test_success() {
        let (dispatcher, ctx, _) = setup();
        let response = dispatcher
            .handle_request(request("echo", json!({"x": 5})), ctx)
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"x": 5})));
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let (dispatcher, ctx, _) = setup();
        let response = dispatcher
            .handle_request(request("nope", json!({})), ctx)
            .await
            .unwrap();
        assert_eq!(response.id, RequestId::Number(1));
        assert_eq!(response.error_kind(), Some(ErrorKind::MethodNotFound));
    }

    #[tokio::test]
    async fn test_invalid_params_skip_handler() {
        let (dispatcher, ctx, _) = setup();
        let response = dispatcher
            .handle_request(request("echo", json!({"x": "five"})), ctx)
            .await
            .unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidParams));
    }

    #[tokio::test]
    async fn test_handler_error_keeps_code() {
        let (dispatcher, ctx, _) = setup();
        let response = dispatcher
            .handle_request(request("fail", json!({})), ctx)
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, 4242);
        assert_eq!(error.kind, Some(ErrorKind::HandlerError));
        assert_eq!(error.message, "quota exceeded");
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let (dispatcher, ctx, _) = setup();
        let response = dispatcher
            .handle_request(request("panic", json!({})), ctx)
            .await
            .unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::Internal));
    }

    #[tokio::test]
    async fn test_cancelled_request_yields_nothing() {
        let (dispatcher, ctx, _) = setup();
        ctx.cancel.cancel();
        let response = dispatcher
            .handle_request(request("echo", json!({"x": 1})), ctx)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_notification_failure_reported_to_sink() {
        let (dispatcher, ctx, sink) = setup();
        dispatcher
            .handle_notification(JsonRpcNotification::new("nope", None), ctx)
            .await;

        let failures = sink.notification_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "nope");
        assert_eq!(failures[0].1, ErrorKind::MethodNotFound);
    }

    #[test]
    fn test_unclassified_errors_are_handler_errors() {
        let error = error_object(Error::Transport("stdin".into()));
        assert_eq!(error.kind, Some(ErrorKind::HandlerError));
        assert_eq!(error.code, -32000);
    }
}
