//! [`MemoryServer`] – newline-delimited JSON over TCP.
//!
//! Listens on `0.0.0.0:50053` (configurable via [`MemoryServer::with_port`]).
//! Every line a client sends is one [`Request`]; the server answers each with
//! exactly one [`Response`] line, in order. A line that does not parse gets an
//! `Error` response and the connection stays open.
//!
//! Core calls are synchronous, so each request takes a permit from a
//! semaphore sized [`MemoryServer::with_max_workers`] and runs on tokio's
//! blocking pool.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use kuro_types::{KuroError, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::service::MemoryService;

/// Default TCP port for the memory server.
pub const DEFAULT_PORT: u16 = 50053;

/// Default number of requests served concurrently.
pub const DEFAULT_MAX_WORKERS: usize = 10;

// ---------------------------------------------------------------------------
// MemoryServer
// ---------------------------------------------------------------------------

/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use kuro_service::{MemoryServer, MemoryService, ServiceConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let service = Arc::new(MemoryService::start(ServiceConfig::default()).unwrap());
///     MemoryServer::new(service)
///         .run()
///         .await
///         .expect("memory server failed");
/// }
/// ```
pub struct MemoryServer {
    service: Arc<MemoryService>,
    port: u16,
    max_workers: usize,
}

impl MemoryServer {
    /// Create a server backed by `service` on the [`DEFAULT_PORT`].
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self {
            service,
            port: DEFAULT_PORT,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the worker bound (builder-style). Clamped to at least one.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Serve forever.
    pub async fn run(self) -> Result<(), KuroError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind `0.0.0.0:<port>` and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`KuroError::Transport`] if the TCP listener cannot bind.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), KuroError>
    where
        F: Future<Output = ()>,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| KuroError::Transport(format!("bind error on {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already-bound `listener` until `shutdown`
    /// resolves. Connections already open keep being served by their tasks.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), KuroError>
    where
        F: Future<Output = ()>,
    {
        let local = listener
            .local_addr()
            .map_err(|e| KuroError::Transport(format!("listener address: {e}")))?;
        info!(addr = %local, max_workers = self.max_workers, "memory server listening");

        let workers = Arc::new(Semaphore::new(self.max_workers));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("memory server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&self.service);
                        let workers = Arc::clone(&workers);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, service, workers).await {
                                warn!(%peer, error = %e, "client connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<MemoryService>,
    workers: Arc<Semaphore>,
) -> Result<(), KuroError> {
    debug!(%peer, "client connected");
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| KuroError::Transport(format!("read error from {peer}: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&line, &service, &workers).await;
        let mut payload = serde_json::to_string(&response)
            .map_err(|e| KuroError::Transport(format!("serialization error: {e}")))?;
        payload.push('\n');
        write_half
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| KuroError::Transport(format!("write error to {peer}: {e}")))?;
    }

    debug!(%peer, "client disconnected");
    Ok(())
}

/// Parse one request line and run it on the blocking pool under a worker
/// permit.
pub(crate) async fn dispatch(
    line: &str,
    service: &Arc<MemoryService>,
    workers: &Arc<Semaphore>,
) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed request");
            return Response::Error {
                message: format!("malformed request: {e}"),
            };
        }
    };

    let permit = match Arc::clone(workers).acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            return Response::Error {
                message: KuroError::Transport(e.to_string()).to_string(),
            };
        }
    };

    let service = Arc::clone(service);
    match tokio::task::spawn_blocking(move || {
        let _permit = permit;
        service.handle(request)
    })
    .await
    {
        Ok(response) => response,
        Err(e) => Response::Error {
            message: KuroError::Transport(format!("worker failed: {e}")).to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
