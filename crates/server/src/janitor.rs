//! Engine-process watchdog.
//!
//! A malicious workbook's macro code can hang the engine indefinitely,
//! so every bridge pid is registered with a birth time and a background
//! thread kills anything alive past the configured bound — independent
//! of whether a call is still in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Shared registry of live engine-bridge pids.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    inner: Arc<Mutex<HashMap<u32, Instant>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32) {
        self.inner.lock().unwrap().insert(pid, Instant::now());
    }

    pub fn deregister(&self, pid: u32) {
        self.inner.lock().unwrap().remove(&pid);
    }

    /// Pids that have been alive longer than `max_age`.
    pub fn stale(&self, max_age: Duration) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .filter(|(_, born)| born.elapsed() > max_age)
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Deregisters (and stops tracking) a pid when the owning call ends.
pub struct RegistryGuard {
    registry: EngineRegistry,
    pid: Option<u32>,
}

impl RegistryGuard {
    pub fn new(registry: &EngineRegistry, pid: Option<u32>) -> Self {
        if let Some(pid) = pid {
            registry.register(pid);
        }
        Self { registry: registry.clone(), pid }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            self.registry.deregister(pid);
        }
    }
}

/// Start the watchdog thread.
pub fn spawn_janitor(registry: EngineRegistry, max_age: Duration) -> JoinHandle<()> {
    thread::Builder::new()
        .name("janitor".into())
        .spawn(move || loop {
            thread::sleep(SWEEP_INTERVAL);
            for pid in registry.stale(max_age) {
                log::warn!("killing stale engine bridge: pid {pid}");
                kill_pid(pid);
                registry.deregister(pid);
            }
        })
        .expect("failed to spawn janitor thread")
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_pid(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if !handle.is_null() {
            TerminateProcess(handle, 1);
            CloseHandle(handle);
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_pid(pid: u32) {
    log::warn!("cannot kill pid {pid}: unsupported platform");
}
