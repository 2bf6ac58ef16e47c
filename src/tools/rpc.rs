//! Stdio-framed RPC for the tool surface: newline-delimited JSON, one
//! message per line.
//!
//! Requests are `{id, method, params}`; responses are `{id, result}` or
//! `{id, error: {kind, message, details?}}`. `bash` additionally emits
//! `{id, partial: {stdout|stderr}}` frames before its terminal result.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::errors::{YokeError, YokeResult};

use super::ToolSurface;

#[derive(Debug, Deserialize)]
struct ToolRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Serve the tool surface over a framed byte stream until EOF.
///
/// Generic over the transport so tests can drive it with an in-memory
/// duplex; production wires the agent child process's stdio.
pub async fn serve<R, W>(surface: Arc<ToolSurface>, reader: R, mut writer: W) -> YokeResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| YokeError::Internal(format!("rpc read failed: {e}")))?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for frame in handle_line(&surface, line).await {
            write_frame(&mut writer, &frame).await?;
        }
    }

    debug!("tool rpc stream closed");
    Ok(())
}

/// Process one request line into response frames (partials before the
/// terminal frame).
pub async fn handle_line(surface: &ToolSurface, line: &str) -> Vec<Value> {
    let request: ToolRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return vec![error_frame(
                Value::Null,
                &YokeError::Validation(format!("malformed request: {e}")),
            )];
        }
    };

    let request_key = match &request.id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    match surface
        .dispatch(&request_key, &request.method, request.params)
        .await
    {
        Ok(result) => {
            let mut frames = Vec::new();
            if request.method == "bash" {
                if let Some(stdout) = result.get("stdout").and_then(Value::as_str) {
                    if !stdout.is_empty() {
                        frames.push(json!({"id": request.id, "partial": {"stdout": stdout}}));
                    }
                }
                if let Some(stderr) = result.get("stderr").and_then(Value::as_str) {
                    if !stderr.is_empty() {
                        frames.push(json!({"id": request.id, "partial": {"stderr": stderr}}));
                    }
                }
            }
            frames.push(json!({"id": request.id, "result": result}));
            frames
        }
        Err(err) => vec![error_frame(request.id, &err)],
    }
}

fn error_frame(id: Value, err: &YokeError) -> Value {
    let mut error = json!({
        "kind": err.kind(),
        "message": err.to_string(),
    });
    if let YokeError::BlockedCommand { rule, .. } = err {
        error["details"] = json!({ "rule": rule });
    }
    json!({"id": id, "error": error})
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Value) -> YokeResult<()> {
    let mut bytes = frame.to_string().into_bytes();
    bytes.push(b'\n');
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| YokeError::Internal(format!("rpc write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| YokeError::Internal(format!("rpc flush failed: {e}")))?;
    Ok(())
}
