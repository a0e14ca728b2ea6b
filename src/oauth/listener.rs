//! Loopback listener that captures the authorization redirect.
//!
//! Binds `127.0.0.1:<port>`, accepts exactly one connection, answers it with a
//! static HTML page and closes the socket. The captured `code`/`state` pair is
//! delivered at most once, and never after the listener was closed.

use crate::error::AuthError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on the request head we are willing to read
const MAX_REQUEST_BYTES: u64 = 16 * 1024;

/// Time allowed for the browser to send its request once connected
const READ_TIMEOUT: Duration = Duration::from_secs(10);

const SUCCESS_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Authentication complete</title></head>\
<body><h1>Authentication complete</h1>\
<p>You can close this window and return to your editor.</p></body></html>";

const FAILURE_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Authentication failed</title></head>\
<body><h1>Authentication failed</h1>\
<p>The authorization response was missing or invalid. Return to your editor and try again.</p>\
</body></html>";

/// Parameters captured from a successful redirect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// Classification of one inbound request line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackRequest {
    Captured(CallbackParams),
    /// Provider redirected with `error=...` (e.g. consent denied)
    Denied {
        error: String,
        description: Option<String>,
    },
    Malformed(String),
}

/// Redirect query parameters, in whatever order the provider emits them
#[derive(Deserialize)]
struct RawCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Parses an HTTP request line such as
/// `GET /callback?state=S&code=C HTTP/1.1`.
pub fn parse_request_line(line: &str, callback_path: &str) -> CallbackRequest {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return CallbackRequest::Malformed("invalid HTTP request line".to_string());
    };

    if method != "GET" {
        return CallbackRequest::Malformed(format!("unsupported method {}", method));
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    if path != callback_path {
        return CallbackRequest::Malformed(format!("unexpected path {}", path));
    }

    let raw: RawCallback = match serde_urlencoded::from_str(query) {
        Ok(raw) => raw,
        Err(e) => return CallbackRequest::Malformed(format!("invalid query string: {}", e)),
    };

    if let Some(error) = raw.error {
        return CallbackRequest::Denied {
            error,
            description: raw.error_description,
        };
    }

    match (raw.code, raw.state) {
        (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => {
            CallbackRequest::Captured(CallbackParams { code, state })
        }
        _ => CallbackRequest::Malformed("missing code or state parameter".to_string()),
    }
}

/// Handle to a running single-shot redirect listener.
///
/// Dropping the handle (or calling [`RedirectListener::close`]) closes the
/// listening socket without delivering a result.
pub struct RedirectListener {
    local_addr: SocketAddr,
    result_rx: oneshot::Receiver<CallbackParams>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RedirectListener {
    /// Binds `127.0.0.1:port` and starts waiting for the redirect.
    ///
    /// A port already in use is reported as `ListenerBindFailed` and not
    /// retried.
    pub async fn start(port: u16, callback_path: &str) -> Result<Self, AuthError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AuthError::ListenerBindFailed { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| AuthError::ListenerBindFailed { port, source })?;

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let callback_path = callback_path.to_string();

        let task = tokio::spawn(async move {
            let accepted = tokio::select! {
                _ = shutdown_rx => None,
                accepted = listener.accept() => Some(accepted),
            };
            // Never accept a second connection
            drop(listener);

            let Some(accepted) = accepted else {
                debug!("Redirect listener closed before a callback arrived");
                return;
            };

            let stream = match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted redirect connection");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept redirect connection");
                    return;
                }
            };

            if let Some(params) = handle_connection(stream, &callback_path).await {
                // The receiver is gone if the flow was abandoned meanwhile
                let _ = result_tx.send(params);
            }
        });

        info!(addr = %local_addr, "Redirect listener started");

        Ok(Self {
            local_addr,
            result_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Address actually bound (useful when started on port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the redirect.
    ///
    /// Returns `None` when the single accepted request did not carry a usable
    /// `code`/`state` pair; the listener is closed either way.
    pub async fn wait(self) -> Option<CallbackParams> {
        let Self {
            result_rx,
            shutdown_tx,
            ..
        } = self;
        let result = result_rx.await.ok();
        drop(shutdown_tx);
        result
    }

    /// Closes the listener without delivering a result.
    pub async fn close(self) {
        let Self {
            local_addr,
            mut result_rx,
            shutdown_tx,
            task,
        } = self;

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        result_rx.close();
        task.abort();
        let _ = task.await;
        debug!(addr = %local_addr, "Redirect listener closed");
    }
}

/// Reads the request head, answers with the terminal page, and returns the
/// captured parameters on success.
async fn handle_connection(mut stream: TcpStream, callback_path: &str) -> Option<CallbackParams> {
    let request_line = match tokio::time::timeout(READ_TIMEOUT, read_request_head(&mut stream)).await
    {
        Ok(Ok(line)) => line,
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to read redirect request");
            String::new()
        }
        Err(_) => {
            warn!("Timed out reading redirect request");
            String::new()
        }
    };

    let outcome = parse_request_line(&request_line, callback_path);
    let params = match outcome {
        CallbackRequest::Captured(params) => {
            info!("Authorization redirect captured");
            Some(params)
        }
        CallbackRequest::Denied { error, description } => {
            warn!(
                error = %error,
                description = description.as_deref().unwrap_or("-"),
                "Authorization was denied by the provider"
            );
            None
        }
        CallbackRequest::Malformed(reason) => {
            warn!(reason = %reason, "Rejected malformed redirect request");
            None
        }
    };

    let (status, page) = if params.is_some() {
        ("200 OK", SUCCESS_PAGE)
    } else {
        ("400 Bad Request", FAILURE_PAGE)
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        page.len(),
        page
    );

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!(error = %e, "Failed to write redirect response");
    }
    let _ = stream.shutdown().await;

    params
}

/// Returns the request line after consuming the rest of the head, so closing
/// the socket does not reset the connection under the browser.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut reader = BufReader::new((&mut *stream).take(MAX_REQUEST_BYTES));

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut header = String::new();
    loop {
        header.clear();
        let n = reader.read_line(&mut header).await?;
        if n == 0 || header == "\r\n" || header == "\n" {
            break;
        }
    }

    Ok(request_line.trim_end().to_string())
}
