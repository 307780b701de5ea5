//! Thin RPC client for the controller's Unix-socket surface (§4.F). `reqwest`
//! has no Unix-socket transport, so requests are hand-rolled HTTP/1.1 framed
//! directly over a [`tokio::net::UnixStream`]: a request line, a `Host` and
//! `Content-Type` header, `Connection: close`, the JSON body, then read to
//! EOF and split the response at the header/body blank line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// POST `body` as JSON to `path` and return the parsed JSON response.
    /// Errors if the connection fails or the server responds with a
    /// non-2xx status.
    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<serde_json::Value> {
        let payload = serde_json::to_vec(body).context("failed to serialize request body")?;
        let request = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            payload.len()
        );

        let mut stream = connect(&self.socket_path).await?;
        stream
            .write_all(request.as_bytes())
            .await
            .context("failed to write request headers")?;
        stream
            .write_all(&payload)
            .await
            .context("failed to write request body")?;

        let (status, body) = read_response(stream).await?;
        if !(200..300).contains(&status) {
            bail!("controller returned HTTP {status}: {body}");
        }

        serde_json::from_str(&body).context("failed to parse controller response as JSON")
    }

    /// GET `path` and invoke `on_event` for each `data:` line of an SSE
    /// stream, parsed as JSON. Runs until the connection closes.
    pub async fn stream_sse(
        &self,
        path: &str,
        mut on_event: impl FnMut(serde_json::Value),
    ) -> Result<()> {
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        );

        let mut stream = connect(&self.socket_path).await?;
        stream
            .write_all(request.as_bytes())
            .await
            .context("failed to write request headers")?;

        let mut reader = BufReader::new(stream);

        // Skip the status line + headers.
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.context("failed to read headers")?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .context("failed to read event stream")?;
            if n == 0 {
                break;
            }
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                    on_event(value);
                }
            }
        }

        Ok(())
    }
}

async fn connect(socket_path: &Path) -> Result<UnixStream> {
    UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to controller socket at {}", socket_path.display()))
}

/// Read an HTTP response to EOF (the server always closes the connection
/// since every request sends `Connection: close`) and split it into a
/// status code and body string.
async fn read_response(mut stream: UnixStream) -> Result<(u16, String)> {
    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .context("failed to read response")?;
    let text = String::from_utf8_lossy(&raw);

    let mut parts = text.splitn(2, "\r\n\r\n");
    let header_block = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default().to_string();

    let status_line = header_block.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .context("failed to parse HTTP status line")?;

    Ok((status, body))
}
