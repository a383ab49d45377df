use super::protocol::{
    ExcavatorError, ExcavatorMethod, ExcavatorRequest, ExcavatorResponse, ExcavatorResult,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Default per-call timeout (connect, and again for the request/response exchange)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Excavator API transport.
///
/// Every call opens its own connection, so concurrent callers never share
/// socket state. No retries happen here; that policy belongs to callers.
#[derive(Debug, Clone)]
pub struct Transport {
    address: SocketAddr,
    timeout: Duration,
}

impl Transport {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    async fn connect(&self) -> ExcavatorResult<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ExcavatorError::ConnectionError(format!(
                "Failed to connect to {}: {}",
                self.address, e
            ))),
            Err(_) => Err(ExcavatorError::ConnectionError(format!(
                "Timed out connecting to {}",
                self.address
            ))),
        }
    }

    /// Send a command and wait for its newline-terminated response.
    pub async fn send(
        &self,
        method: ExcavatorMethod,
        params: Vec<String>,
    ) -> ExcavatorResult<ExcavatorResponse> {
        let json_line = ExcavatorRequest::new(method, params).to_json_line()?;
        tracing::trace!("Sending: {}", json_line.trim());

        let mut stream = self.connect().await?;
        let line = tokio::time::timeout(self.timeout, async {
            stream.write_all(json_line.as_bytes()).await?;
            stream.flush().await?;

            let mut reader = BufReader::new(&mut stream);
            let mut buf = Vec::new();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 || buf.last() != Some(&b'\n') {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before end of response",
                ));
            }
            buf.pop();
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no response to {} within {:?}", method, self.timeout),
            )
        })??;

        tracing::trace!("Received: {}", String::from_utf8_lossy(&line));

        let response: ExcavatorResponse = serde_json::from_slice(&line)?;
        if response.is_error() {
            return Err(ExcavatorError::ProtocolError {
                method: method.as_str().to_string(),
                response: response.to_value(),
            });
        }
        Ok(response)
    }

    /// Send a command without reading a response. Used for `quit`, where
    /// excavator may close the socket before replying.
    pub async fn send_only(&self, method: ExcavatorMethod, params: Vec<String>) -> ExcavatorResult<()> {
        let json_line = ExcavatorRequest::new(method, params).to_json_line()?;
        tracing::trace!("Sending (no reply): {}", json_line.trim());

        let mut stream = self.connect().await?;
        tokio::time::timeout(self.timeout, async {
            stream.write_all(json_line.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one connection: read the request line, then write `reply` in
    /// the given chunks with a pause in between.
    async fn serve_once(reply: Vec<&'static str>) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                socket.read_exact(&mut byte).await.unwrap();
                if byte[0] == b'\n' {
                    break;
                }
                request.push(byte[0]);
            }
            for chunk in reply {
                socket.write_all(chunk.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            String::from_utf8(request).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_send_reads_up_to_first_newline() {
        let (addr, server) = serve_once(vec![
            "{\"id\":1,\"error\":null,",
            "\"worker_id\":4}\n{\"garbage\":",
        ])
        .await;
        let transport = Transport::new(addr);
        let response = transport
            .send(ExcavatorMethod::WorkerAdd, vec!["equihash".into(), "0".into()])
            .await
            .unwrap();
        assert_eq!(response.body["worker_id"], 4);

        let request = server.await.unwrap();
        assert_eq!(
            request,
            r#"{"id":1,"method":"worker.add","params":["equihash","0"]}"#
        );
    }

    #[tokio::test]
    async fn test_error_field_is_protocol_error() {
        let (addr, _server) = serve_once(vec!["{\"id\":1,\"error\":\"no such worker\"}\n"]).await;
        let err = Transport::new(addr)
            .send(ExcavatorMethod::WorkerFree, vec!["9".into()])
            .await
            .unwrap_err();
        match err {
            ExcavatorError::ProtocolError { method, response } => {
                assert_eq!(method, "worker.free");
                assert_eq!(response["error"], "no such worker");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Transport::new(addr)
            .send(ExcavatorMethod::Info, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExcavatorError::ConnectionError(_)));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_partial_response_is_not_a_response() {
        let (addr, _server) = serve_once(vec!["{\"id\":1,\"error\":null"]).await;
        let err = Transport::new(addr)
            .with_timeout(Duration::from_secs(2))
            .send(ExcavatorMethod::Info, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExcavatorError::IoError(_)));
    }
}
