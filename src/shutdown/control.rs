// Worker control endpoint client
// Delivers the graceful stop request (POST /shutdown) to a worker's own port

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

pub const SHUTDOWN_PATH: &str = "/shutdown";

/// Result of the graceful stop request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulRequest {
    /// Worker acknowledged the request
    Accepted { status: String, elapsed: Duration },

    /// Request could not be delivered or was not acknowledged.
    /// Expected outcome, not an error: the graceful phase is skipped.
    Unreachable(String),
}

impl GracefulRequest {
    pub fn accepted(&self) -> bool {
        matches!(self, GracefulRequest::Accepted { .. })
    }
}

#[derive(Debug, Deserialize)]
struct ShutdownAck {
    status: String,
}

/// Ask the worker listening on `host:port` to stop. Never takes longer than `budget`.
pub async fn request_shutdown(host: IpAddr, port: u16, budget: Duration) -> GracefulRequest {
    let started = Instant::now();
    match tokio::time::timeout(budget, send(SocketAddr::new(host, port))).await {
        Ok(Ok(status)) => GracefulRequest::Accepted {
            status,
            elapsed: started.elapsed(),
        },
        Ok(Err(e)) => GracefulRequest::Unreachable(e.to_string()),
        Err(_) => GracefulRequest::Unreachable(format!(
            "no response within {}ms",
            budget.as_millis()
        )),
    }
}

async fn send(addr: SocketAddr) -> anyhow::Result<String> {
    let stream = TcpStream::connect(addr).await?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

    // Dropped (and the connection torn down) even if the caller's timeout fires
    let _connection = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Control connection closed with error");
        }
    }));

    let request = Request::builder()
        .method(Method::POST)
        .uri(SHUTDOWN_PATH)
        .header(header::HOST, addr.to_string())
        .body(Empty::<Bytes>::new())?;

    let result = async {
        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if status != StatusCode::OK {
            anyhow::bail!("worker answered {}", status);
        }
        let ack: ShutdownAck = serde_json::from_slice(&body)?;
        Ok::<_, anyhow::Error>(ack.status)
    }
    .await;

    drop(sender);
    result
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn one_shot_server(response: &'static str) -> u16 {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_acknowledged_request() {
        let port = one_shot_server(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 32\r\n\r\n{\"status\":\"shutdown_initiated\"}\n",
        )
        .await;

        let result = request_shutdown(LOCALHOST, port, Duration::from_secs(2)).await;
        match result {
            GracefulRequest::Accepted { status, .. } => assert_eq!(status, "shutdown_initiated"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = request_shutdown(LOCALHOST, port, Duration::from_secs(2)).await;
        assert!(!result.accepted());
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let started = Instant::now();
        let result = request_shutdown(LOCALHOST, port, Duration::from_millis(300)).await;

        assert!(matches!(result, GracefulRequest::Unreachable(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
    }

    #[tokio::test]
    async fn test_error_status_is_not_accepted() {
        let port = one_shot_server("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n").await;

        let result = request_shutdown(LOCALHOST, port, Duration::from_secs(2)).await;
        assert!(matches!(result, GracefulRequest::Unreachable(msg) if msg.contains("503")));
    }
}
