//! The service layer: store + cache + engine wiring.
//!
//! Each call that needs engine access opens a fresh session against the
//! stored document path and tears it down when the call completes.
//! Extraction and property lookups run through the memo cache;
//! evaluation is stateful and never memoized.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use cellprobe_engine::{
    props, trampoline, AccessedSet, CellAddress, CellValue, EngineError, EngineSession,
    EngineSpawner,
};
use cellprobe_extract::{extract, Snapshot};
use cellprobe_protocol::{ErrorCode, ErrorResponse};
use cellprobe_store::{DocumentStore, MemoCache, StoreError};

use crate::janitor::{EngineRegistry, RegistryGuard};

#[derive(Debug)]
pub enum ServiceError {
    Engine(EngineError),
    Store(StoreError),
    /// Cache payload failed to (de)serialize.
    Encode(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Encode(msg) => write!(f, "encode error: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl ServiceError {
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            Self::Engine(err) => ErrorResponse::from_engine_error(err),
            Self::Store(StoreError::UnknownHandle(handle)) => ErrorResponse {
                code: ErrorCode::BadRequest,
                message: format!("unknown document handle: {handle}"),
            },
            Self::Store(err) => {
                ErrorResponse { code: ErrorCode::Storage, message: err.to_string() }
            }
            Self::Encode(msg) => {
                ErrorResponse { code: ErrorCode::Storage, message: msg.clone() }
            }
        }
    }
}

/// One service instance shared by all worker threads.
pub struct Service {
    store: DocumentStore,
    memo: MemoCache,
    spawner: Arc<dyn EngineSpawner>,
    registry: EngineRegistry,
}

impl Service {
    pub fn new(
        store: DocumentStore,
        memo: MemoCache,
        spawner: Arc<dyn EngineSpawner>,
        registry: EngineRegistry,
    ) -> Self {
        Self { store, memo, spawner, registry }
    }

    /// Store document bytes, returning the content-digest handle.
    pub fn upload(&self, bytes: &[u8]) -> Result<String, ServiceError> {
        Ok(self.store.put(bytes)?)
    }

    /// Full structural extraction, memoized per document.
    pub fn extract(&self, handle: &str, nocache: bool) -> Result<Snapshot, ServiceError> {
        let path = self.store.resolve(handle)?;
        let args = json!({ "handle": handle });
        let value = self.memo.cached("process", &args, nocache, || {
            let mut session = self.open_session(&path)?;
            let snapshot = extract(&mut session)?;
            encode(&snapshot)
        })?;
        decode(value)
    }

    /// Indexed cell-property lookup, memoized.
    pub fn cell_info(
        &self,
        handle: &str,
        sheet: &str,
        col: &str,
        row: u32,
        index: u32,
        nocache: bool,
    ) -> Result<CellValue, ServiceError> {
        let path = self.store.resolve(handle)?;
        let args = json!({
            "handle": handle,
            "sheet": sheet,
            "col": col,
            "row": row,
            "index": index,
        });
        let value = self.memo.cached("get_cell_info", &args, nocache, || {
            let mut session = self.open_session(&path)?;
            let addr = CellAddress::new(sheet, col, row);
            encode(&props::cell_property(&mut session, &addr, index)?)
        })?;
        decode(value)
    }

    /// Indexed workbook-property lookup, memoized.
    pub fn workbook_info(
        &self,
        handle: &str,
        index: u32,
        nocache: bool,
    ) -> Result<CellValue, ServiceError> {
        let path = self.store.resolve(handle)?;
        let args = json!({ "handle": handle, "index": index });
        let value = self.memo.cached("get_workbook_info", &args, nocache, || {
            let mut session = self.open_session(&path)?;
            encode(&props::workbook_property(&mut session, index)?)
        })?;
        decode(value)
    }

    /// Formula evaluation. Stateful — never memoized.
    pub fn evaluate(
        &self,
        handle: &str,
        sheet: &str,
        col: &str,
        row: u32,
        formula: &str,
        accessed: &AccessedSet,
    ) -> Result<(CellValue, AccessedSet), ServiceError> {
        let path = self.store.resolve(handle)?;
        let mut session = self.open_session(&path)?;
        Ok(trampoline::evaluate(&mut session, sheet, col, row, formula, accessed)?)
    }

    fn open_session(&self, path: &Path) -> Result<TrackedSession, ServiceError> {
        let session = EngineSession::open(self.spawner.as_ref(), path)?;
        let guard = RegistryGuard::new(&self.registry, session.pid());
        Ok(TrackedSession { session, _guard: guard })
    }
}

/// Session plus its janitor registration.
struct TrackedSession {
    session: EngineSession,
    _guard: RegistryGuard,
}

impl std::ops::Deref for TrackedSession {
    type Target = EngineSession;
    fn deref(&self) -> &EngineSession {
        &self.session
    }
}

impl std::ops::DerefMut for TrackedSession {
    fn deref_mut(&mut self) -> &mut EngineSession {
        &mut self.session
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::Encode(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ServiceError> {
    serde_json::from_value(value).map_err(|e| ServiceError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellprobe_engine::backend::EngineBackend;
    use cellprobe_engine::harness::{GridEngine, GridSpawner};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Spawner that counts how many engine processes were started.
    struct CountingSpawner {
        inner: GridSpawner,
        spawned: AtomicUsize,
    }

    impl CountingSpawner {
        fn new(engine: GridEngine) -> Self {
            Self { inner: GridSpawner::new(engine), spawned: AtomicUsize::new(0) }
        }
    }

    impl EngineSpawner for CountingSpawner {
        fn spawn(&self) -> Result<Box<dyn EngineBackend>, EngineError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.inner.spawn()
        }
    }

    fn service_with(engine: GridEngine) -> (tempfile::TempDir, Service, Arc<CountingSpawner>) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path().join("docs")).unwrap();
        let memo = MemoCache::new(dir.path().join("memo")).unwrap();
        let spawner = Arc::new(CountingSpawner::new(engine));
        let service =
            Service::new(store, memo, spawner.clone(), EngineRegistry::new());
        (dir, service, spawner)
    }

    #[test]
    fn test_upload_dedup() {
        let (_dir, service, _) = service_with(GridEngine::new());
        let a = service.upload(b"doc").unwrap();
        let b = service.upload(b"doc").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_is_memoized() {
        let (_dir, service, spawner) = service_with(GridEngine::new());
        let handle = service.upload(b"doc").unwrap();

        let first = service.extract(&handle, false).unwrap();
        let second = service.extract(&handle, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);

        service.extract(&handle, true).unwrap();
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_evaluate_never_memoized() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Number(5.0));
        let (_dir, service, spawner) = service_with(engine);
        let handle = service.upload(b"doc").unwrap();

        let empty = AccessedSet::default();
        let (first, _) = service.evaluate(&handle, "Sheet1", "A", 1, "A1+1", &empty).unwrap();
        let (second, _) = service.evaluate(&handle, "Sheet1", "A", 1, "A1+1", &empty).unwrap();
        assert_eq!(first, CellValue::Number(6.0));
        assert_eq!(second, CellValue::Number(6.0));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_evaluate_restores_target_cell() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Number(5.0));
        let (_dir, service, _) = service_with(engine);
        let handle = service.upload(b"doc").unwrap();

        service
            .evaluate(&handle, "Sheet1", "A", 1, "A1+1", &AccessedSet::default())
            .unwrap();
        // A fresh session still sees the original constant.
        let value = service.cell_info(&handle, "Sheet1", "A", 1, 5, true).unwrap();
        assert_eq!(value, CellValue::Number(5.0));
    }

    #[test]
    fn test_cell_info_foo_and_unsupported() {
        let mut engine = GridEngine::new();
        engine.set_value("Sheet1", "A", 1, CellValue::Text("foo".into()));
        let (_dir, service, _) = service_with(engine);
        let handle = service.upload(b"doc").unwrap();

        let value = service.cell_info(&handle, "Sheet1", "A", 1, 5, false).unwrap();
        assert_eq!(value, CellValue::Text("foo".into()));

        match service.cell_info(&handle, "Sheet1", "A", 1, 999, false) {
            Err(ServiceError::Engine(EngineError::UnsupportedIndex(999))) => {}
            other => panic!("expected UnsupportedIndex, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_handle_is_bad_request() {
        let (_dir, service, _) = service_with(GridEngine::new());
        let err = service.extract(&"0".repeat(64), false).unwrap_err();
        assert_eq!(err.to_response().code, ErrorCode::BadRequest);
    }
}
