//! Oracle Server Protocol — v1 Frozen Wire Format
//!
//! Canonical protocol types for analysis-client ↔ oracle-server
//! communication. The wire format is JSONL (newline-delimited JSON)
//! over TCP.
//!
//! Every expensive call is idempotent under identical arguments (the
//! server memoizes them) except `Evaluate`, which is explicitly
//! stateful and is never memoized.

use serde::{Deserialize, Serialize};

use cellprobe_engine::{AccessedSet, CellValue, EngineError};
use cellprobe_extract::Snapshot;

/// Current protocol version. Increment for breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Client → Server Messages
// =============================================================================

/// Messages sent from the analysis client to the oracle server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Hello(HelloRequest),
    Upload(UploadRequest),
    Extract(ExtractRequest),
    CellInfo(CellInfoRequest),
    WorkbookInfo(WorkbookInfoRequest),
    Evaluate(EvaluateRequest),
}

/// Initial handshake. Must be the first frame on a connection; the
/// server drops the connection on a token mismatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub client: String,
    pub version: String,
    pub token: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    1
}

/// Submit raw document bytes (base64).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub data: String,
}

/// Request the full structural snapshot of a stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub handle: String,
    #[serde(default)]
    pub nocache: bool,
}

/// Indexed cell-property lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellInfoRequest {
    pub handle: String,
    pub sheet: String,
    pub col: String,
    pub row: u32,
    pub index: u32,
    #[serde(default)]
    pub nocache: bool,
}

/// Indexed workbook-property lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbookInfoRequest {
    pub handle: String,
    pub index: u32,
    #[serde(default)]
    pub nocache: bool,
}

/// Evaluate one formula as if typed into a cell, threading the caller's
/// accessed set through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub handle: String,
    pub sheet: String,
    pub col: String,
    pub row: u32,
    pub formula: String,
    #[serde(default)]
    pub accessed: AccessedSet,
}

// =============================================================================
// Server → Client Messages
// =============================================================================

/// Messages sent from the oracle server to the analysis client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    Welcome(WelcomeResponse),
    Uploaded(UploadedResponse),
    Snapshot(SnapshotResponse),
    Property(PropertyResponse),
    Evaluated(EvaluatedResponse),
    Error(ErrorResponse),
}

/// Welcome after a successful hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeResponse {
    pub protocol_version: u32,
    pub server: String,
}

/// Opaque stable handle for uploaded bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedResponse {
    pub handle: String,
}

/// Full structural snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub snapshot: Snapshot,
}

/// Single property value from an indexed lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyResponse {
    pub value: CellValue,
}

/// Evaluation result plus the refreshed accessed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatedResponse {
    pub result: CellValue,
    pub accessed: AccessedSet,
}

/// Structured failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Error taxonomy on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Handshake failed; connection will be dropped.
    AuthFailed,
    /// Malformed frame or unknown handle.
    BadRequest,
    /// Engine could not be configured. Non-retryable for this document.
    EngineInit,
    /// Even repair-mode open failed. Non-retryable.
    DocumentOpen,
    /// Name corruption persisted after the repair round-trip.
    NameCorruption,
    /// Trampoline failure; the session was discarded.
    Execution,
    /// Lookup-table miss — caller error, not a system fault.
    UnsupportedIndex,
    /// Engine-level exception surfaced verbatim.
    Processing,
    /// Server-side storage failure.
    Storage,
}

impl ErrorCode {
    pub fn from_engine_error(err: &EngineError) -> Self {
        match err {
            EngineError::Init(_) => Self::EngineInit,
            EngineError::DocumentOpen(_) => Self::DocumentOpen,
            EngineError::NameCorruption(_) => Self::NameCorruption,
            EngineError::Execution(_) => Self::Execution,
            EngineError::UnsupportedIndex(_) => Self::UnsupportedIndex,
            EngineError::Bridge(_) | EngineError::Processing(_) | EngineError::Io(_) => {
                Self::Processing
            }
        }
    }
}

impl ErrorResponse {
    pub fn from_engine_error(err: &EngineError) -> Self {
        Self { code: ErrorCode::from_engine_error(err), message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = ClientRequest::Extract(ExtractRequest { handle: "ab12".into(), nocache: false });
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"extract","handle":"ab12","nocache":false}"#);
    }

    #[test]
    fn test_nocache_defaults_false() {
        let req: ClientRequest =
            serde_json::from_str(r#"{"type":"extract","handle":"ab12"}"#).unwrap();
        match req {
            ClientRequest::Extract(extract) => assert!(!extract.nocache),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_evaluate_accepts_missing_accessed() {
        let req: ClientRequest = serde_json::from_str(
            r#"{"type":"evaluate","handle":"ab","sheet":"Sheet1","col":"A","row":1,"formula":"A1+1"}"#,
        )
        .unwrap();
        match req {
            ClientRequest::Evaluate(eval) => assert!(eval.accessed.is_empty()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_error_code_mapping() {
        let err = EngineError::UnsupportedIndex(999);
        let resp = ErrorResponse::from_engine_error(&err);
        assert_eq!(resp.code, ErrorCode::UnsupportedIndex);
        assert_eq!(
            serde_json::to_string(&resp.code).unwrap(),
            r#""unsupported_index""#
        );
    }

    #[test]
    fn test_response_round_trip() {
        let resp = ServerResponse::Evaluated(EvaluatedResponse {
            result: CellValue::Number(6.0),
            accessed: AccessedSet::default(),
        });
        let json = serde_json::to_string(&resp).unwrap();
        let back: ServerResponse = serde_json::from_str(&json).unwrap();
        match back {
            ServerResponse::Evaluated(e) => assert_eq!(e.result, CellValue::Number(6.0)),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
