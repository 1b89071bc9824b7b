//! MCP server: newline-delimited JSON-RPC over stdio.
//!
//! Each request is handled on its own task and responses are written as they
//! complete (JSON-RPC correlates by id, so out-of-order responses are fine).
//! This keeps `get_status` responsive while a multi-minute render holds the
//! lifecycle gate.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Result;

use crate::generator::FluxGenerator;
use crate::{log_debug, log_error, log_info, log_warn};

use super::handlers::Handlers;
use super::protocol::{error_codes, JsonRpcRequest, JsonRpcResponse};

pub struct McpServer {
    handlers: Arc<Handlers>,
}

impl McpServer {
    pub fn new(generator: Arc<FluxGenerator>) -> Self {
        McpServer {
            handlers: Arc::new(Handlers::new(generator)),
        }
    }

    /// Run until stdin closes.
    pub async fn run(&self) -> Result<()> {
        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        // Single writer task: stdout must not interleave partial lines.
        let writer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(line) = out_rx.recv().await {
                if writeln!(stdout, "{line}").and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
        });

        // Blocking stdin reader on a plain thread; lines flow into the async
        // loop through a channel.
        let (in_tx, mut in_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) => {
                        if in_tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("Error reading stdin: {e}");
                        break;
                    }
                }
            }
        });

        log_info!("MCP server ready, waiting for requests");

        while let Some(line) = in_rx.recv().await {
            if line.trim().is_empty() {
                continue;
            }
            log_debug!("Received: {line}");

            let handlers = self.handlers.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let response = handle_request(&handlers, &line).await;

                // Notifications produce no response.
                if response.id.is_none() && response.result.is_none() && response.error.is_none() {
                    return;
                }

                match serde_json::to_string(&response) {
                    Ok(json) => {
                        let _ = out_tx.send(json);
                    }
                    Err(e) => log_error!("Failed to serialize response: {e}"),
                }
            });
        }

        drop(out_tx);
        let _ = writer.await;
        log_info!("MCP server shutting down");
        Ok(())
    }
}

async fn handle_request(handlers: &Handlers, input: &str) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(input) {
        Ok(r) => r,
        Err(e) => {
            log_warn!("Failed to parse request: {e}");
            return JsonRpcResponse::error(
                None,
                error_codes::PARSE_ERROR,
                format!("Parse error: {e}"),
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::error(
            request.id,
            error_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        );
    }

    handlers.dispatch(request).await
}
