//! JSON-RPC server implementation
//!
//! Line-delimited JSON-RPC 2.0 over a Unix socket and/or TCP. Handlers are
//! registered by method name and are async: every rodent command awaits the
//! policy manager.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::protocol::{error_codes, JsonRpcRequest, JsonRpcResponse};

/// Async handler function type
pub type HandlerFn =
    Box<dyn Fn(JsonRpcRequest) -> BoxFuture<'static, JsonRpcResponse> + Send + Sync>;

/// JSON-RPC server configuration
#[derive(Clone)]
pub struct JsonRpcServerConfig {
    /// Unix socket path (optional)
    pub unix_socket: Option<String>,
    /// TCP address (optional)
    pub tcp_addr: Option<String>,
}

impl Default for JsonRpcServerConfig {
    fn default() -> Self {
        Self {
            unix_socket: Some("/var/run/rodent/jsonrpc.sock".to_string()),
            tcp_addr: None,
        }
    }
}

/// JSON-RPC server
pub struct JsonRpcServer {
    config: JsonRpcServerConfig,
    handlers: Arc<RwLock<HashMap<String, HandlerFn>>>,
}

impl JsonRpcServer {
    /// Create a new JSON-RPC server
    pub fn new(config: JsonRpcServerConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(JsonRpcServerConfig::default())
    }

    /// Register a handler for a method name
    pub async fn register_handler(&self, method: &str, handler: HandlerFn) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(method.to_string(), handler);
    }

    /// Run the server until its listeners fail
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut handles = Vec::new();

        if let Some(ref socket_path) = self.config.unix_socket {
            let server = Arc::clone(&self);
            let path = socket_path.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run_unix(&path).await {
                    error!("Unix socket server error: {}", e);
                }
            }));
        }

        if let Some(ref addr) = self.config.tcp_addr {
            let server = Arc::clone(&self);
            let addr = addr.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run_tcp(&addr).await {
                    error!("TCP server error: {}", e);
                }
            }));
        }

        for handle in handles {
            handle.await?;
        }

        Ok(())
    }

    async fn run_unix(self: Arc<Self>, socket_path: &str) -> Result<()> {
        let path = Path::new(socket_path);

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.ok();
        }
        if path.exists() {
            tokio::fs::remove_file(path).await.ok();
        }

        let listener = UnixListener::bind(path).context("Failed to bind Unix socket")?;
        info!("JSON-RPC server listening on unix:{}", socket_path);

        loop {
            let (stream, _) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_unix_connection(stream).await {
                    debug!("Connection error: {}", e);
                }
            });
        }
    }

    async fn run_tcp(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .context("Failed to bind TCP socket")?;
        info!("JSON-RPC server listening on tcp:{}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_tcp_connection(stream).await {
                    debug!("Connection error: {}", e);
                }
            });
        }
    }

    async fn handle_unix_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, writer) = stream.into_split();
        self.serve_lines(BufReader::new(reader), writer).await
    }

    async fn handle_tcp_connection(&self, stream: TcpStream) -> Result<()> {
        let (reader, writer) = stream.into_split();
        self.serve_lines(BufReader::new(reader), writer).await
    }

    async fn serve_lines<R, W>(&self, mut reader: BufReader<R>, mut writer: W) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();
        while reader.read_line(&mut line).await? > 0 {
            let response = self.process_line(&line).await;
            let response_str = serde_json::to_string(&response)?;
            writer.write_all(response_str.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            line.clear();
        }
        Ok(())
    }

    /// Process one request line
    pub async fn process_line(&self, line: &str) -> JsonRpcResponse {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => match serde_json::from_value::<JsonRpcRequest>(value.clone()) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => JsonRpcResponse::error(
                    value.get("id").cloned().unwrap_or(Value::Null),
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {}", e),
                ),
            },
            Err(e) => JsonRpcResponse::error(
                Value::Null,
                error_codes::PARSE_ERROR,
                format!("Parse error: {}", e),
            ),
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        {
            let handlers = self.handlers.read().await;
            if let Some(handler) = handlers.get(&request.method) {
                return handler(request).await;
            }
        }

        match request.method.as_str() {
            "server.info" => JsonRpcResponse::success(
                request.id,
                json!({
                    "name": "rodent JSON-RPC Server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "unix_socket": self.config.unix_socket,
                    "tcp_addr": self.config.tcp_addr,
                }),
            ),
            "echo" => JsonRpcResponse::success(request.id, request.params),
            _ => JsonRpcResponse::error(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("Unknown method: {}", request.method),
            ),
        }
    }
}
