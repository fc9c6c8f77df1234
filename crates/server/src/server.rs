//! TCP front end.
//!
//! JSONL over TCP. A fixed pool of worker threads pulls accepted
//! connections off a channel; each connection must open with a `hello`
//! frame carrying the shared token before anything is dispatched.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use base64::Engine as _;

use cellprobe_protocol::{
    ClientRequest, ErrorCode, ErrorResponse, EvaluatedResponse, PropertyResponse, ServerResponse,
    SnapshotResponse, UploadedResponse, WelcomeResponse, PROTOCOL_VERSION,
};

use crate::auth::AuthToken;
use crate::service::Service;

/// Maximum consecutive parse failures before disconnecting a client.
const MAX_PARSE_FAILURES: u32 = 3;

/// Frame size ceiling. Uploads carry whole documents in base64, so this
/// is generous; anything larger is a protocol abuse.
const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

pub struct Server {
    listener: TcpListener,
    service: Arc<Service>,
    auth: Arc<AuthToken>,
    workers: usize,
}

impl Server {
    pub fn bind(
        addr: &str,
        port: u16,
        service: Arc<Service>,
        auth: AuthToken,
        workers: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((addr, port))?;
        Ok(Self { listener, service, auth: Arc::new(auth), workers })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails. Connections queue on
    /// a channel consumed by the worker pool, so at most `workers`
    /// engine-bearing calls run at once.
    pub fn serve(self) -> std::io::Result<()> {
        let (tx, rx) = mpsc::channel::<TcpStream>();
        let rx = Arc::new(Mutex::new(rx));

        for n in 0..self.workers {
            let rx = rx.clone();
            let service = self.service.clone();
            let auth = self.auth.clone();
            thread::Builder::new()
                .name(format!("worker-{n}"))
                .spawn(move || loop {
                    let stream = match rx.lock().unwrap().recv() {
                        Ok(stream) => stream,
                        Err(_) => break,
                    };
                    let peer = stream.peer_addr().ok();
                    if let Err(e) = handle_connection(stream, &auth, &service) {
                        log::warn!("connection error from {peer:?}: {e}");
                    }
                })?;
        }

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::debug!("accepted connection from {addr}");
                    if tx.send(stream).is_err() {
                        break Ok(());
                    }
                }
                Err(e) => {
                    log::error!("accept error: {e}");
                    break Err(e);
                }
            }
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    auth: &AuthToken,
    service: &Service,
) -> std::io::Result<()> {
    stream.set_write_timeout(Some(std::time::Duration::from_secs(10)))?;
    let reader = BufReader::new(stream.try_clone()?);
    let mut lines = reader.lines();
    let mut authenticated = false;
    let mut parse_failures: u32 = 0;

    loop {
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        };

        if line.len() > MAX_FRAME_SIZE {
            send(&mut stream, &error(ErrorCode::BadRequest, "frame too large"))?;
            log::warn!("oversized frame ({} bytes), disconnecting", line.len());
            return Ok(());
        }

        let request: ClientRequest = match serde_json::from_str(&line) {
            Ok(request) => {
                parse_failures = 0;
                request
            }
            Err(e) => {
                parse_failures += 1;
                log::debug!("malformed frame ({parse_failures}/{MAX_PARSE_FAILURES}): {e}");
                send(&mut stream, &error(ErrorCode::BadRequest, "malformed frame"))?;
                if parse_failures >= MAX_PARSE_FAILURES {
                    return Ok(());
                }
                continue;
            }
        };

        // First frame must be a valid hello; anything else drops the
        // connection after a single error response.
        if !authenticated {
            match request {
                ClientRequest::Hello(hello) => {
                    if !auth.verify(&hello.token) {
                        send(&mut stream, &error(ErrorCode::AuthFailed, "token mismatch"))?;
                        return Ok(());
                    }
                    if hello.protocol_version > PROTOCOL_VERSION {
                        send(
                            &mut stream,
                            &error(ErrorCode::BadRequest, "unsupported protocol version"),
                        )?;
                        return Ok(());
                    }
                    authenticated = true;
                    log::debug!("client authenticated: {} {}", hello.client, hello.version);
                    send(
                        &mut stream,
                        &ServerResponse::Welcome(WelcomeResponse {
                            protocol_version: PROTOCOL_VERSION,
                            server: format!("cellprobe/{}", env!("CARGO_PKG_VERSION")),
                        }),
                    )?;
                }
                _ => {
                    send(&mut stream, &error(ErrorCode::AuthFailed, "hello required"))?;
                    return Ok(());
                }
            }
            continue;
        }

        let response = dispatch(request, service);
        send(&mut stream, &response)?;
    }
}

fn dispatch(request: ClientRequest, service: &Service) -> ServerResponse {
    match request {
        // Redundant but harmless once authenticated.
        ClientRequest::Hello(_) => ServerResponse::Welcome(WelcomeResponse {
            protocol_version: PROTOCOL_VERSION,
            server: format!("cellprobe/{}", env!("CARGO_PKG_VERSION")),
        }),
        ClientRequest::Upload(upload) => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(&upload.data) {
                Ok(bytes) => bytes,
                Err(e) => return error(ErrorCode::BadRequest, &format!("bad base64: {e}")),
            };
            match service.upload(&bytes) {
                Ok(handle) => ServerResponse::Uploaded(UploadedResponse { handle }),
                Err(e) => ServerResponse::Error(e.to_response()),
            }
        }
        ClientRequest::Extract(req) => match service.extract(&req.handle, req.nocache) {
            Ok(snapshot) => ServerResponse::Snapshot(SnapshotResponse { snapshot }),
            Err(e) => ServerResponse::Error(e.to_response()),
        },
        ClientRequest::CellInfo(req) => {
            match service.cell_info(&req.handle, &req.sheet, &req.col, req.row, req.index, req.nocache)
            {
                Ok(value) => ServerResponse::Property(PropertyResponse { value }),
                Err(e) => ServerResponse::Error(e.to_response()),
            }
        }
        ClientRequest::WorkbookInfo(req) => {
            match service.workbook_info(&req.handle, req.index, req.nocache) {
                Ok(value) => ServerResponse::Property(PropertyResponse { value }),
                Err(e) => ServerResponse::Error(e.to_response()),
            }
        }
        ClientRequest::Evaluate(req) => {
            match service.evaluate(&req.handle, &req.sheet, &req.col, req.row, &req.formula, &req.accessed)
            {
                Ok((result, accessed)) => {
                    ServerResponse::Evaluated(EvaluatedResponse { result, accessed })
                }
                Err(e) => ServerResponse::Error(e.to_response()),
            }
        }
    }
}

fn error(code: ErrorCode, message: &str) -> ServerResponse {
    ServerResponse::Error(ErrorResponse { code, message: message.to_string() })
}

fn send(stream: &mut TcpStream, response: &ServerResponse) -> std::io::Result<()> {
    let mut frame = serde_json::to_vec(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    frame.push(b'\n');
    stream.write_all(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::janitor::EngineRegistry;
    use base64::Engine as _;
    use cellprobe_engine::harness::{GridEngine, GridSpawner};
    use cellprobe_engine::CellValue;
    use cellprobe_store::{DocumentStore, MemoCache};
    use std::io::BufRead;

    fn start_server(engine: GridEngine) -> (SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path().join("docs")).unwrap();
        let memo = MemoCache::new(dir.path().join("memo")).unwrap();
        let service = Arc::new(Service::new(
            store,
            memo,
            Arc::new(GridSpawner::new(engine)),
            EngineRegistry::new(),
        ));
        let auth = AuthToken::from_config(Some("sesame".to_string()));
        let server = Server::bind("127.0.0.1", 0, service, auth, 2).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || {
            let _ = server.serve();
        });
        (addr, dir)
    }

    fn connect(addr: SocketAddr) -> (TcpStream, std::io::Lines<BufReader<TcpStream>>) {
        let stream = TcpStream::connect(addr).unwrap();
        let lines = BufReader::new(stream.try_clone().unwrap()).lines();
        (stream, lines)
    }

    fn send_line(stream: &mut TcpStream, frame: &str) {
        stream.write_all(frame.as_bytes()).unwrap();
        stream.write_all(b"\n").unwrap();
    }

    fn recv(lines: &mut std::io::Lines<BufReader<TcpStream>>) -> ServerResponse {
        let line = lines.next().unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn hello(stream: &mut TcpStream, lines: &mut std::io::Lines<BufReader<TcpStream>>) {
        send_line(
            stream,
            r#"{"type":"hello","client":"test","version":"0","token":"sesame"}"#,
        );
        match recv(lines) {
            ServerResponse::Welcome(welcome) => {
                assert_eq!(welcome.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[test]
    fn test_hello_then_upload() {
        let (addr, _dir) = start_server(GridEngine::new());
        let (mut stream, mut lines) = connect(addr);
        hello(&mut stream, &mut lines);

        let data = base64::engine::general_purpose::STANDARD.encode(b"doc");
        send_line(&mut stream, &format!(r#"{{"type":"upload","data":"{data}"}}"#));
        match recv(&mut lines) {
            ServerResponse::Uploaded(uploaded) => assert_eq!(uploaded.handle.len(), 64),
            other => panic!("expected uploaded, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_token_drops_connection() {
        let (addr, _dir) = start_server(GridEngine::new());
        let (mut stream, mut lines) = connect(addr);
        send_line(
            &mut stream,
            r#"{"type":"hello","client":"test","version":"0","token":"wrong"}"#,
        );
        match recv(&mut lines) {
            ServerResponse::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_request_before_hello_is_rejected() {
        let (addr, _dir) = start_server(GridEngine::new());
        let (mut stream, mut lines) = connect(addr);
        send_line(&mut stream, r#"{"type":"extract","handle":"ab"}"#);
        match recv(&mut lines) {
            ServerResponse::Error(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_parse_failures_disconnect() {
        let (addr, _dir) = start_server(GridEngine::new());
        let (mut stream, mut lines) = connect(addr);
        hello(&mut stream, &mut lines);
        for _ in 0..MAX_PARSE_FAILURES {
            send_line(&mut stream, "not json");
            match recv(&mut lines) {
                ServerResponse::Error(err) => assert_eq!(err.code, ErrorCode::BadRequest),
                other => panic!("expected error, got {other:?}"),
            }
        }
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_evaluate_round_trip() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Number(5.0));
        let (addr, _dir) = start_server(engine);
        let (mut stream, mut lines) = connect(addr);
        hello(&mut stream, &mut lines);

        let data = base64::engine::general_purpose::STANDARD.encode(b"doc");
        send_line(&mut stream, &format!(r#"{{"type":"upload","data":"{data}"}}"#));
        let handle = match recv(&mut lines) {
            ServerResponse::Uploaded(uploaded) => uploaded.handle,
            other => panic!("expected uploaded, got {other:?}"),
        };

        send_line(
            &mut stream,
            &format!(
                r#"{{"type":"evaluate","handle":"{handle}","sheet":"Sheet1","col":"B","row":2,"formula":"A1+1"}}"#
            ),
        );
        match recv(&mut lines) {
            ServerResponse::Evaluated(evaluated) => {
                assert_eq!(evaluated.result, CellValue::Number(6.0));
                assert!(evaluated.accessed.is_empty());
            }
            other => panic!("expected evaluated, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_handle_error() {
        let (addr, _dir) = start_server(GridEngine::new());
        let (mut stream, mut lines) = connect(addr);
        hello(&mut stream, &mut lines);
        let handle = "0".repeat(64);
        send_line(&mut stream, &format!(r#"{{"type":"extract","handle":"{handle}"}}"#));
        match recv(&mut lines) {
            ServerResponse::Error(err) => assert_eq!(err.code, ErrorCode::BadRequest),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
