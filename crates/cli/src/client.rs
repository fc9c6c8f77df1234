//! Oracle server client.
//!
//! Blocking TCP, JSONL frames. One connection carries the hello
//! handshake followed by any number of request/response pairs.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use base64::Engine as _;

use cellprobe_engine::{AccessedSet, CellValue};
use cellprobe_extract::Snapshot;
use cellprobe_protocol::{
    CellInfoRequest, ClientRequest, EvaluateRequest, EvaluatedResponse, ExtractRequest,
    HelloRequest, ServerResponse, UploadRequest, WorkbookInfoRequest, PROTOCOL_VERSION,
};

/// Generous: a single evaluation can legitimately run until the
/// server-side engine timeout fires.
const READ_TIMEOUT: Duration = Duration::from_secs(660);

#[derive(Debug)]
pub enum ClientError {
    /// Connection or I/O failure
    Network(String),
    /// Frame that does not fit the protocol
    Protocol(String),
    /// Handshake rejected
    Auth(String),
    /// Structured error from the server
    Server(cellprobe_protocol::ErrorResponse),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Network(msg) => write!(f, "network error: {msg}"),
            ClientError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ClientError::Auth(msg) => write!(f, "authentication failed: {msg}"),
            ClientError::Server(err) => write!(f, "server error ({:?}): {}", err.code, err.message),
        }
    }
}

impl std::error::Error for ClientError {}

pub struct OracleClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl OracleClient {
    /// Connect and complete the hello handshake.
    pub fn connect(addr: &str, token: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| ClientError::Network(format!("connect {addr}: {e}")))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let reader = BufReader::new(
            stream.try_clone().map_err(|e| ClientError::Network(e.to_string()))?,
        );
        let mut client = Self { stream, reader };

        let hello = ClientRequest::Hello(HelloRequest {
            client: "cellprobe-cli".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            token: token.to_string(),
            protocol_version: PROTOCOL_VERSION,
        });
        match client.request(&hello)? {
            ServerResponse::Welcome(welcome) => {
                log::debug!("connected to {} (protocol v{})", welcome.server, welcome.protocol_version);
                Ok(client)
            }
            ServerResponse::Error(err) => Err(ClientError::Auth(err.message)),
            other => Err(ClientError::Protocol(format!("unexpected handshake reply: {other:?}"))),
        }
    }

    pub fn upload(&mut self, bytes: &[u8]) -> Result<String, ClientError> {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        match self.request(&ClientRequest::Upload(UploadRequest { data }))? {
            ServerResponse::Uploaded(uploaded) => Ok(uploaded.handle),
            other => Self::unexpected(other),
        }
    }

    pub fn extract(&mut self, handle: &str, nocache: bool) -> Result<Snapshot, ClientError> {
        let request =
            ClientRequest::Extract(ExtractRequest { handle: handle.to_string(), nocache });
        match self.request(&request)? {
            ServerResponse::Snapshot(snapshot) => Ok(snapshot.snapshot),
            other => Self::unexpected(other),
        }
    }

    pub fn cell_info(
        &mut self,
        handle: &str,
        sheet: &str,
        col: &str,
        row: u32,
        index: u32,
        nocache: bool,
    ) -> Result<CellValue, ClientError> {
        let request = ClientRequest::CellInfo(CellInfoRequest {
            handle: handle.to_string(),
            sheet: sheet.to_string(),
            col: col.to_string(),
            row,
            index,
            nocache,
        });
        match self.request(&request)? {
            ServerResponse::Property(property) => Ok(property.value),
            other => Self::unexpected(other),
        }
    }

    pub fn workbook_info(
        &mut self,
        handle: &str,
        index: u32,
        nocache: bool,
    ) -> Result<CellValue, ClientError> {
        let request = ClientRequest::WorkbookInfo(WorkbookInfoRequest {
            handle: handle.to_string(),
            index,
            nocache,
        });
        match self.request(&request)? {
            ServerResponse::Property(property) => Ok(property.value),
            other => Self::unexpected(other),
        }
    }

    pub fn evaluate(
        &mut self,
        handle: &str,
        sheet: &str,
        col: &str,
        row: u32,
        formula: &str,
        accessed: AccessedSet,
    ) -> Result<EvaluatedResponse, ClientError> {
        let request = ClientRequest::Evaluate(EvaluateRequest {
            handle: handle.to_string(),
            sheet: sheet.to_string(),
            col: col.to_string(),
            row,
            formula: formula.to_string(),
            accessed,
        });
        match self.request(&request)? {
            ServerResponse::Evaluated(evaluated) => Ok(evaluated),
            other => Self::unexpected(other),
        }
    }

    fn request(&mut self, request: &ClientRequest) -> Result<ServerResponse, ClientError> {
        let mut frame = serde_json::to_vec(request)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        frame.push(b'\n');
        self.stream
            .write_all(&frame)
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| ClientError::Network(e.to_string()))?;
        if read == 0 {
            return Err(ClientError::Network("server closed the connection".to_string()));
        }
        serde_json::from_str(&line).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    fn unexpected<T>(response: ServerResponse) -> Result<T, ClientError> {
        match response {
            ServerResponse::Error(err) => Err(ClientError::Server(err)),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Minimal scripted server: answers hello, then echoes canned
    /// responses for each subsequent frame.
    fn scripted_server(responses: Vec<String>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut lines = BufReader::new(stream).lines();

            let hello = lines.next().unwrap().unwrap();
            let reply = if hello.contains(r#""token":"sesame""#) {
                r#"{"type":"welcome","protocol_version":1,"server":"test"}"#.to_string()
            } else {
                r#"{"type":"error","code":"auth_failed","message":"token mismatch"}"#.to_string()
            };
            writer.write_all(reply.as_bytes()).unwrap();
            writer.write_all(b"\n").unwrap();

            for response in responses {
                if lines.next().is_none() {
                    break;
                }
                writer.write_all(response.as_bytes()).unwrap();
                writer.write_all(b"\n").unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_handshake_and_upload() {
        let addr = scripted_server(vec![format!(
            r#"{{"type":"uploaded","handle":"{}"}}"#,
            "a".repeat(64)
        )]);
        let mut client = OracleClient::connect(&addr.to_string(), "sesame").unwrap();
        let handle = client.upload(b"doc").unwrap();
        assert_eq!(handle, "a".repeat(64));
    }

    #[test]
    fn test_bad_token() {
        let addr = scripted_server(vec![]);
        match OracleClient::connect(&addr.to_string(), "wrong") {
            Err(ClientError::Auth(_)) => {}
            Err(e) => panic!("expected Auth, got {e}"),
            Ok(_) => panic!("expected Auth, connect succeeded"),
        }
    }

    #[test]
    fn test_server_error_surfaces() {
        let addr = scripted_server(vec![
            r#"{"type":"error","code":"bad_request","message":"unknown document handle"}"#
                .to_string(),
        ]);
        let mut client = OracleClient::connect(&addr.to_string(), "sesame").unwrap();
        match client.extract("deadbeef", false) {
            Err(ClientError::Server(err)) => {
                assert_eq!(err.code, cellprobe_protocol::ErrorCode::BadRequest);
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }
}
