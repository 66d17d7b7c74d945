//! Line-oriented TCP adapter.
//!
//! Matrix switchers, IR blasters and newline-delimited JSON-RPC DSPs all speak
//! "write one terminated line, read one terminated line". This adapter only does the
//! framing; the payload is passed through untouched.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::error::{ConnectionError, ProtocolError, TransportError};
use crate::protocol::{Command, ProtocolAdapter, ProtocolKind, Response, Transport};

/// Adapter for devices that exchange terminated text lines over TCP.
#[derive(Debug, Clone)]
pub struct LineTcpAdapter {
    kind: ProtocolKind,
    terminator: String,
    keep_alive: Option<String>,
    error_prefix: Option<String>,
}

impl LineTcpAdapter {
    pub fn new(kind: impl Into<ProtocolKind>) -> Self {
        Self {
            kind: kind.into(),
            terminator: "\r\n".to_string(),
            keep_alive: None,
            error_prefix: None,
        }
    }

    /// Video matrix switchers: CRLF framing.
    pub fn matrix() -> Self {
        Self::new(ProtocolKind::MATRIX_LINE)
    }

    /// IR blasters: CR framing, `ERR` replies mean the device refused the code.
    pub fn ir_blaster() -> Self {
        Self::new(ProtocolKind::IR_BLASTER)
            .with_terminator("\r")
            .with_error_prefix("ERR")
    }

    /// Audio DSPs speaking newline-delimited JSON-RPC.
    pub fn dsp_jsonrpc() -> Self {
        Self::new(ProtocolKind::DSP_JSONRPC).with_terminator("\n")
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Command sent as the keep-alive probe. Without one, probes only check that the
    /// peer has not closed the socket.
    pub fn with_keep_alive(mut self, command: impl Into<String>) -> Self {
        self.keep_alive = Some(command.into());
        self
    }

    pub fn with_error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.error_prefix = Some(prefix.into());
        self
    }
}

#[async_trait]
impl ProtocolAdapter for LineTcpAdapter {
    fn kind(&self) -> ProtocolKind {
        self.kind.clone()
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>, ConnectionError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ConnectionError::from_io(address, &e))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(address = %address, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(address = %address, protocol = %self.kind, "Line transport connected");

        Ok(Box::new(LineTransport {
            address: address.to_string(),
            reader: BufReader::new(stream),
            terminator: self.terminator.clone(),
            keep_alive: self.keep_alive.clone(),
            error_prefix: self.error_prefix.clone(),
        }))
    }
}

struct LineTransport {
    address: String,
    reader: BufReader<TcpStream>,
    terminator: String,
    keep_alive: Option<String>,
    error_prefix: Option<String>,
}

impl LineTransport {
    fn io_error(&self, err: std::io::Error) -> TransportError {
        ConnectionError::from_io(&self.address, &err).into()
    }

    async fn read_reply(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let delimiter = self.terminator.as_bytes().last().copied().unwrap_or(b'\n');
        let mut buf = Vec::new();

        let read = match time::timeout(timeout, self.reader.read_until(delimiter, &mut buf)).await {
            Ok(read) => read,
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        match read {
            Ok(0) => Err(ConnectionError::Reset("peer closed the connection".into()).into()),
            Ok(_) => {
                let text = String::from_utf8(buf)
                    .map_err(|_| ProtocolError::Malformed("response is not valid UTF-8".into()))?;
                let reply = text.trim_end_matches(&['\r', '\n'][..]).to_string();
                if reply.is_empty() {
                    return Err(ProtocolError::Malformed("empty response".into()).into());
                }
                Ok(reply)
            }
            Err(e) => Err(self.io_error(e)),
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn send(&mut self, command: &Command, timeout: Duration) -> Result<Response, TransportError> {
        let started = Instant::now();
        let frame = format!("{}{}", command.payload(), self.terminator);

        if let Err(e) = self.reader.get_mut().write_all(frame.as_bytes()).await {
            return Err(self.io_error(e));
        }
        if let Err(e) = self.reader.get_mut().flush().await {
            return Err(self.io_error(e));
        }

        let reply = self.read_reply(timeout).await?;

        if let Some(prefix) = &self.error_prefix {
            if reply.starts_with(prefix.as_str()) {
                return Err(ProtocolError::Rejected(reply).into());
            }
        }

        Ok(Response::new(reply, started.elapsed()))
    }

    async fn probe(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if let Some(keep_alive) = self.keep_alive.clone() {
            return match self.send(&Command::new(keep_alive), timeout).await {
                Ok(_) | Err(TransportError::Protocol(ProtocolError::Rejected(_))) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let mut scratch = [0u8; 256];
        match self.reader.get_ref().try_read(&mut scratch) {
            Ok(0) => Err(ConnectionError::Reset("peer closed the connection".into()).into()),
            Ok(n) => {
                tracing::trace!(address = %self.address, discarded = n, "Discarded unsolicited bytes");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.reader.get_mut().shutdown().await {
            tracing::debug!(address = %self.address, error = %e, "Error closing line transport");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers each CRLF line with `reply(line)`.
    async fn line_server(reply: fn(&str) -> Option<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => match reply(line.trim_end()) {
                        Some(answer) => {
                            let _ = reader.get_mut().write_all(answer.as_bytes()).await;
                        }
                        None => break,
                    },
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn sends_and_reads_one_line() {
        let addr = line_server(|line| Some(format!("OK {}\r\n", line))).await;
        let adapter = LineTcpAdapter::matrix();
        let mut transport = adapter.connect(&addr).await.unwrap();

        let response = transport
            .send(&Command::new("MT00SW0102NT"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.payload, "OK MT00SW0102NT");

        transport.disconnect().await;
    }

    #[tokio::test]
    async fn error_prefix_is_a_rejection() {
        let addr = line_server(|_| Some("ERR unknown code\r\n".into())).await;
        let adapter = LineTcpAdapter::matrix().with_error_prefix("ERR");
        let mut transport = adapter.connect(&addr).await.unwrap();

        let err = transport
            .send(&Command::new("sendir,1:1,1,38000"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(ProtocolError::Rejected(_))));
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 64];
            while let Ok(n) = socket.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });

        let mut transport = LineTcpAdapter::matrix().connect(&addr).await.unwrap();
        let err = transport
            .send(&Command::new("PING"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn probe_detects_closed_peer() {
        let addr = line_server(|_| None).await;
        let mut transport = LineTcpAdapter::matrix().connect(&addr).await.unwrap();

        assert!(transport.probe(Duration::from_millis(100)).await.is_ok());

        // Any line makes the server hang up.
        let _ = transport.send(&Command::new("bye"), Duration::from_millis(200)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = transport.probe(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(ConnectionError::Reset(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = LineTcpAdapter::matrix().connect(&addr).await.err().unwrap();
        assert!(matches!(err, ConnectionError::Refused { .. }));
    }
}
