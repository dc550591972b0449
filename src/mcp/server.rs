//! MCP server implementation.
//!
//! The server owns the configuration and the frozen handler registry. It
//! accepts connections from the configured transport, runs each as a
//! [`Session`] on its own task, and on shutdown closes every session and
//! waits for them to drain.

use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::{Config, TransportKind};
use crate::error::Result;
use crate::http::{HttpSettings, HttpTransport};
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::registry::HandlerRegistry;
use crate::mcp::session::{Session, SessionHandle, SessionId, SessionOptions, SessionState};
use crate::mcp::transport::{StdioTransport, Transport};
use crate::observe::EventSink;
use crate::VERSION;

/// MCP server.
pub struct McpServer {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn EventSink>,
    metrics: Option<PrometheusHandle>,
}

impl McpServer {
    /// Create a server. The registry is frozen from here on.
    pub fn new(config: Config, registry: HandlerRegistry, sink: Arc<dyn EventSink>) -> Self {
        info!("Registered {} methods", registry.len());
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), sink.clone()));
        Self {
            config,
            dispatcher,
            sink,
            metrics: None,
        }
    }

    /// Expose a Prometheus recorder on the HTTP transport's `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            drain_timeout: self.config.drain_timeout,
            dispatch: self.config.dispatch,
        }
    }

    /// Run on the configured transport until SIGINT/SIGTERM, or until the
    /// stdio session ends.
    pub async fn serve(&self) -> Result<()> {
        info!("Starting Doxie MCP server v{}", VERSION);

        let transport: Arc<dyn Transport> = match self.config.transport {
            TransportKind::Stdio => {
                info!("Starting stdio transport...");
                Arc::new(StdioTransport::new().max_frame_bytes(self.config.max_frame_bytes))
            }
            TransportKind::Http => {
                let mut transport = HttpTransport::new(HttpSettings::from_config(&self.config));
                if let Some(handle) = &self.metrics {
                    transport = transport.with_metrics(handle.clone());
                }
                Arc::new(transport.bind().await?)
            }
        };

        self.serve_with(transport, shutdown_signal()).await
    }

    /// Run on `transport` until `shutdown` resolves or the transport stops
    /// producing connections and every session has closed.
    pub async fn serve_with<F>(&self, transport: Arc<dyn Transport>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut sessions: JoinSet<SessionId> = JoinSet::new();
        let mut handles: HashMap<SessionId, SessionHandle> = HashMap::new();
        let mut accepting = true;

        loop {
            if !accepting && sessions.is_empty() {
                debug!("No more connections and no live sessions");
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                connection = transport.accept(), if accepting => match connection {
                    Some(connection) => {
                        let (session, handle) = Session::new(
                            connection,
                            self.dispatcher.clone(),
                            self.session_options(),
                            self.sink.clone(),
                        );
                        let id = handle.id().clone();
                        handles.insert(id.clone(), handle);
                        sessions.spawn(async move {
                            let reason = session.run().await;
                            debug!("Session {} ended: {}", id, reason);
                            id
                        });
                    }
                    None => {
                        debug!("Transport stopped accepting connections");
                        accepting = false;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    forget_session(&mut handles, joined);
                }
            }
        }

        transport.shutdown().await;
        if !handles.is_empty() {
            info!("Closing {} session(s)", handles.len());
        }
        for handle in handles.values() {
            handle.close();
        }
        while let Some(joined) = sessions.join_next().await {
            forget_session(&mut handles, joined);
        }

        let result = transport.finish().await;
        info!("MCP server stopped");
        result
    }
}

fn forget_session(
    handles: &mut HashMap<SessionId, SessionHandle>,
    joined: std::result::Result<SessionId, tokio::task::JoinError>,
) {
    match joined {
        Ok(id) => {
            handles.remove(&id);
        }
        Err(e) => {
            error!("Session task failed: {}", e);
            handles.retain(|_, handle| handle.state() != SessionState::Closed);
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
