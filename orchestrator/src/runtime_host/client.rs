//! HTTP client for the runtime running inside an instance.
//!
//! The runtime serves `GET /health` and executes the handler on `POST`.
//! Every invocation is therefore sent as a `POST` to the original path and
//! query, with the caller's method in `x-faas-method`. A status of 400 or
//! above is a handler error whose message comes from a JSON
//! `{"error": ...}` body when present.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use data_model::{RuntimeRequest, RuntimeResponse};
use reqwest::{header::CONTENT_TYPE, Method};

use crate::error::HostError;

const HEALTH_PATH: &str = "/health";

/// Carries the inbound method, since the runtime only executes on `POST`.
pub const METHOD_HEADER: &str = "x-faas-method";

/// Headers that describe the inbound connection rather than the request.
const SKIPPED_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
];

#[derive(Clone)]
pub struct RuntimeClient {
    http: reqwest::Client,
}

impl RuntimeClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("building runtime http client")?;
        Ok(Self { http })
    }

    pub async fn invoke(
        &self,
        address: &str,
        request: &RuntimeRequest,
        timeout: Duration,
    ) -> Result<RuntimeResponse, HostError> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            HostError::Handler {
                status: 405,
                message: format!("unsupported method {:?}", request.method),
            }
        })?;
        let path = if request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };

        let mut builder = self
            .http
            .post(format!("http://{}{}", address, path))
            .query(&request.query)
            .timeout(timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.contains(&name.as_str()) || name == METHOD_HEADER {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.header(METHOD_HEADER, method.as_str());

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        if status >= 400 {
            return Err(HostError::Handler {
                status,
                message: error_message(&body),
            });
        }
        Ok(RuntimeResponse {
            status,
            content_type,
            body,
        })
    }

    pub async fn health(&self, address: &str, timeout: Duration) -> Result<()> {
        let response = self
            .http
            .get(format!("http://{}{}", address, HEALTH_PATH))
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("health check returned {}", response.status()));
        }
        Ok(())
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> HostError {
    if err.is_timeout() {
        HostError::Timeout(timeout)
    } else {
        HostError::Unreachable(err.into())
    }
}

fn error_message(body: &Bytes) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(message) = value.get("error").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    fn http_response(status_line: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status_line,
            content_type,
            body.len(),
            body
        )
    }

    /// Serves one canned HTTP response and returns the raw request it
    /// received.
    async fn serve_once(
        response: String,
        delay: Duration,
    ) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: "))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            tokio::time::sleep(delay).await;
            let _ = socket.write_all(response.as_bytes()).await;
            String::from_utf8_lossy(&raw).to_string()
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_invoke_forwards_request() {
        let (addr, server) = serve_once(
            http_response("200 OK", "application/json", r#"{"ok":true}"#),
            Duration::ZERO,
        )
        .await;
        let client = RuntimeClient::new().unwrap();
        let request = RuntimeRequest::new("POST", "/greet")
            .with_header("X-Trace", "t-1")
            .with_query("name", "ada")
            .with_body("hello");

        let response = client
            .invoke(&addr.to_string(), &request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(response.text().unwrap(), "{\"ok\":true}");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /greet?name=ada HTTP/1.1"));
        assert!(raw.contains("x-trace: t-1"));
        assert!(raw.contains("x-faas-method: POST"));
        assert!(raw.ends_with("hello"));
    }

    #[tokio::test]
    async fn test_get_invocation_is_posted_to_runtime() {
        let (addr, server) = serve_once(
            http_response("200 OK", "application/json", r#"{"ran":true}"#),
            Duration::ZERO,
        )
        .await;
        let client = RuntimeClient::new().unwrap();
        let request = RuntimeRequest::new("GET", "/items/7")
            .with_query("verbose", "1")
            .with_header("X-Faas-Method", "DELETE");

        let response = client
            .invoke(&addr.to_string(), &request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "{\"ran\":true}");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /items/7?verbose=1 HTTP/1.1"), "{raw}");
        assert_eq!(raw.matches("x-faas-method").count(), 1, "{raw}");
        assert!(raw.contains("x-faas-method: GET"), "{raw}");
    }

    #[tokio::test]
    async fn test_invalid_method_is_rejected() {
        let client = RuntimeClient::new().unwrap();
        let err = client
            .invoke(
                "127.0.0.1:1",
                &RuntimeRequest::new("BAD METHOD", "/"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Handler { status: 405, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_invoke_maps_handler_error() {
        let (addr, _server) = serve_once(
            http_response(
                "500 Internal Server Error",
                "application/json",
                r#"{"error": "division by zero", "status": 500}"#,
            ),
            Duration::ZERO,
        )
        .await;
        let client = RuntimeClient::new().unwrap();
        let err = client
            .invoke(
                &addr.to_string(),
                &RuntimeRequest::new("POST", "/"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        match err {
            HostError::Handler { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "division by zero");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let (addr, _server) = serve_once(
            http_response("200 OK", "text/plain", ""),
            Duration::from_secs(5),
        )
        .await;
        let client = RuntimeClient::new().unwrap();
        let err = client
            .invoke(
                &addr.to_string(),
                &RuntimeRequest::new("GET", "/"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unreachable_runtime() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RuntimeClient::new().unwrap();
        let err = client
            .invoke(
                &addr.to_string(),
                &RuntimeRequest::new("GET", "/"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Unreachable(_)));
        assert!(client
            .health(&addr.to_string(), Duration::from_secs(1))
            .await
            .is_err());
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(&Bytes::from_static(br#"{"error": "boom", "status": 500}"#)),
            "boom"
        );
        assert_eq!(error_message(&Bytes::from_static(b"plain failure\n")), "plain failure");
    }
}
