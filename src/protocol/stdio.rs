//! Line-delimited transport
//!
//! Reads one JSON request per line, writes exactly one JSON response per
//! line, flushing after each so the peer never blocks on a buffered reply.
//! The loop is generic over the underlying streams; production wires it to
//! stdin/stdout, tests drive it with in-memory buffers.

use std::io::{BufRead, Write};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};

use super::{Dispatcher, ReadyLine, Request, Response};

pub struct ProtocolLoop<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> ProtocolLoop<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Serve requests until EOF or a `shutdown` request. The readiness line
    /// is the first thing written; no request is read before it.
    pub fn run(mut self, dispatcher: &mut Dispatcher) -> ServerResult<()> {
        let ctx = dispatcher.context();
        let ready = ReadyLine {
            ready: true,
            model: ctx.model_id.clone(),
            device: ctx.device.clone(),
            backend: Some(ctx.backend.clone()),
        };
        self.write_line(&serde_json::to_string(&ready).map_err(|e| ServerError::Protocol {
            message: format!("failed to encode readiness line: {}", e),
        })?)?;
        info!(
            "Ready: model={} device={} backend={}",
            ctx.model_id, ctx.device, ctx.backend
        );

        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                info!("Input stream closed, exiting");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let (response, shutting_down) = match parse_request(trimmed) {
                Ok(request) => {
                    let shutting_down = request.method == "shutdown";
                    (dispatcher.dispatch(request), shutting_down)
                }
                Err((id, e)) => {
                    warn!("Discarding malformed request line: {}", e);
                    (Response::error(id, format!("Invalid request: {}", e)), false)
                }
            };

            let encoded =
                serde_json::to_string(&response).map_err(|e| ServerError::Protocol {
                    message: format!("failed to encode response: {}", e),
                })?;
            self.write_line(&encoded)?;

            if shutting_down {
                info!("Shutdown requested, exiting");
                break;
            }
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> ServerResult<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Decode one request line. On failure the error carries a best-effort id:
/// a well-formed JSON object still has its `id` echoed even when the rest
/// of the request shape is invalid.
fn parse_request(line: &str) -> Result<Request, (Value, String)> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| (Value::Null, e.to_string()))?;
    let id = value
        .as_object()
        .and_then(|obj| obj.get("id"))
        .cloned()
        .unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| (id, e.to_string()))
}
