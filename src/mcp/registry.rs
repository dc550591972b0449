//! Handler registry.
//!
//! Maps method names to handlers. The registry is filled before the server
//! starts and then frozen behind an `Arc`; nothing reachable from a running
//! server can mutate it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mcp::schema::InputValidator;
use crate::mcp::session::RequestContext;

/// A method implementation.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Run the method. `params` is `Value::Null` when the message had none.
    async fn call(&self, params: Value, ctx: RequestContext) -> Result<Value>;
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Value, ctx: RequestContext) -> Result<Value> {
        (self.f)(params, ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// A registered method.
#[derive(Clone)]
pub struct HandlerEntry {
    pub method: String,
    pub validator: Arc<dyn InputValidator>,
    pub handler: Arc<dyn MethodHandler>,
}

/// Method name to handler mapping.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same method twice is an error.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        validator: Arc<dyn InputValidator>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<()> {
        let method = method.into();
        if self.entries.contains_key(&method) {
            return Err(Error::DuplicateMethod(method));
        }
        self.entries.insert(
            method.clone(),
            HandlerEntry {
                method,
                validator,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, method: &str) -> Option<&HandlerEntry> {
        self.entries.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.entries.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}
