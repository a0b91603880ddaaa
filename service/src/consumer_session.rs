//! Handle-based consumer API for language bindings.
//!
//! Each tracing session is addressed by an integer handle that is also a
//! real eventfd: it becomes readable when the trace ends, so callers can
//! `poll()` it instead of spinning on [`ConsumerSessionApi::poll_state`].
//! A thin `extern "C"` layer over the safe API sits at the bottom of this
//! module.
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use prost::encoding::{WireType, encode_key, encode_varint};

use crate::endpoints::{Consumer, ConsumerEndpoint};
use crate::errors::{Error, Result};
use crate::service::{SessionState, TracingService};
use ferrotrace_proto::config::TraceConfig;

/// Session state as seen by a polling consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ConsumerState {
    TraceFailed = -3,
    Disconnected = -2,
    SessionNotFound = -1,
    Connecting = 1,
    /// Buffers allocated, waiting for an explicit start
    /// (`deferred_start`).
    Configured = 2,
    Tracing = 3,
    /// The trace can now be retrieved with `read_trace`.
    TraceEnded = 4,
}

struct HandleState {
    consumer_state: ConsumerState,
    /// Trace packets length-delimited into a `Trace` frame as they
    /// arrive.
    assembling: Vec<u8>,
}

struct SessionHandle {
    endpoint: OnceLock<Arc<ConsumerEndpoint>>,
    state: Mutex<HandleState>,
    cond: Condvar,
    /// Written once when the trace ends; stable storage for the C ABI.
    final_trace: OnceLock<Box<[u8]>>,
    eventfd: OwnedFd,
}

impl SessionHandle {
    fn signal_trace_ended(&self) {
        let value = 1u64.to_ne_bytes();
        unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
            );
        }
        self.cond.notify_all();
    }
}

/// The `Consumer` the service talks back to; owns nothing, upgrades its
/// handle or drops the callback.
struct HandleConsumer {
    handle: Weak<SessionHandle>,
}

impl Consumer for HandleConsumer {
    fn on_connect(&self) {}

    fn on_disconnect(&self) {
        if let Some(handle) = self.handle.upgrade() {
            handle.state.lock().unwrap().consumer_state = ConsumerState::Disconnected;
            handle.cond.notify_all();
        }
    }

    fn on_tracing_disabled(&self) {
        let Some(handle) = self.handle.upgrade() else {
            return;
        };
        // Pull the buffers; on_trace_data slices follow on the service's
        // runner and the final one completes the handle.
        if let Some(endpoint) = handle.endpoint.get() {
            endpoint.read_buffers();
        }
    }

    fn on_trace_data(&self, packets: Vec<Bytes>, has_more: bool) {
        let Some(handle) = self.handle.upgrade() else {
            return;
        };
        let mut state = handle.state.lock().unwrap();
        for packet in packets {
            encode_key(1, WireType::LengthDelimited, &mut state.assembling);
            encode_varint(packet.len() as u64, &mut state.assembling);
            state.assembling.extend_from_slice(&packet);
        }
        if !has_more {
            let trace = std::mem::take(&mut state.assembling);
            state.consumer_state = ConsumerState::TraceEnded;
            drop(state);
            let _ = handle.final_trace.set(trace.into_boxed_slice());
            handle.signal_trace_ended();
        }
    }
}

/// Registry of session handles over one [`TracingService`].
pub struct ConsumerSessionApi {
    service: TracingService,
    sessions: Mutex<HashMap<RawFd, Arc<SessionHandle>>>,
}

impl ConsumerSessionApi {
    pub fn new(service: TracingService) -> Arc<Self> {
        Arc::new(Self {
            service,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Starts (or, with `deferred_start`, configures) a session from an
    /// encoded `TraceConfig`. The returned handle is a pollable fd that
    /// becomes readable at trace end; release it with
    /// [`destroy`](Self::destroy), never `close()`.
    pub fn enable_tracing(&self, config_bytes: &[u8]) -> Result<RawFd> {
        let config = TraceConfig::decode(config_bytes)
            .map_err(|e| Error::InvalidConfig(format!("undecodable config: {e}")))?;
        let deferred = config.deferred_start();

        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(Error::InvalidConfig("eventfd allocation failed".into()));
        }
        let eventfd = unsafe { OwnedFd::from_raw_fd(raw) };

        let handle = Arc::new(SessionHandle {
            endpoint: OnceLock::new(),
            state: Mutex::new(HandleState {
                consumer_state: ConsumerState::Connecting,
                assembling: Vec::new(),
            }),
            cond: Condvar::new(),
            final_trace: OnceLock::new(),
            eventfd,
        });
        let consumer = Arc::new(HandleConsumer {
            handle: Arc::downgrade(&handle),
        });
        let endpoint = self.service.connect_consumer(consumer);
        handle.endpoint.set(endpoint.clone()).ok();

        if let Err(e) = endpoint.enable_tracing(config) {
            endpoint.disconnect();
            return Err(e);
        }
        handle.state.lock().unwrap().consumer_state = if deferred {
            ConsumerState::Configured
        } else {
            ConsumerState::Tracing
        };

        let fd = handle.eventfd.as_raw_fd();
        self.sessions.lock().unwrap().insert(fd, handle);
        Ok(fd)
    }

    pub fn start_tracing(&self, handle: RawFd) -> Result<()> {
        let session = self.session(handle)?;
        let endpoint = session.endpoint.get().unwrap();
        endpoint.start_tracing()?;
        session.state.lock().unwrap().consumer_state = ConsumerState::Tracing;
        Ok(())
    }

    /// Ends the capture; the trace becomes readable once the data sources
    /// have stopped and the buffers were drained.
    pub fn disable_tracing(&self, handle: RawFd) -> Result<()> {
        let session = self.session(handle)?;
        session.endpoint.get().unwrap().disable_tracing()
    }

    /// Checkpoint: everything committed before the flush request is
    /// observable by the service when the callback reports success.
    pub fn flush(
        &self,
        handle: RawFd,
        timeout: Duration,
        callback: Box<dyn FnOnce(bool) + Send>,
    ) {
        match self.session(handle) {
            Ok(session) => session.endpoint.get().unwrap().flush(timeout, callback),
            Err(_) => callback(false),
        }
    }

    pub fn poll_state(&self, handle: RawFd) -> ConsumerState {
        let Ok(session) = self.session(handle) else {
            return ConsumerState::SessionNotFound;
        };
        // The service's view wins for live sessions so that a duration
        // expiry is observed without any callback having run yet.
        let endpoint = session.endpoint.get().unwrap();
        let local = session.state.lock().unwrap().consumer_state;
        match endpoint.session_state() {
            Some(SessionState::Configured) => ConsumerState::Configured,
            Some(SessionState::Active | SessionState::Flushing) => ConsumerState::Tracing,
            Some(SessionState::Disabled) | None => local,
        }
    }

    /// Returns the whole trace once ended, blocking up to `wait` for it.
    /// A non-ended (or failed) session yields an empty buffer.
    pub fn read_trace(&self, handle: RawFd, wait: Option<Duration>) -> Vec<u8> {
        let Ok(session) = self.session(handle) else {
            return Vec::new();
        };
        if session.final_trace.get().is_none()
            && let Some(wait) = wait
        {
            let state = session.state.lock().unwrap();
            let _unused = session
                .cond
                .wait_timeout_while(state, wait, |_| session.final_trace.get().is_none());
        }
        session
            .final_trace
            .get()
            .map(|t| t.to_vec())
            .unwrap_or_default()
    }

    /// Tears down the session and the handle. The fd is closed here; the
    /// caller must not close it directly.
    pub fn destroy(&self, handle: RawFd) {
        let Some(session) = self.sessions.lock().unwrap().remove(&handle) else {
            return;
        };
        if let Some(endpoint) = session.endpoint.get() {
            endpoint.disconnect();
        }
    }

    fn session(&self, handle: RawFd) -> Result<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(Error::SessionNotFound)
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_API: Mutex<Option<Arc<ConsumerSessionApi>>> = Mutex::new(None);
}

/// Makes `api` the instance behind the `extern "C"` surface.
pub fn install_global_session_api(api: Arc<ConsumerSessionApi>) {
    *GLOBAL_API.lock().unwrap() = Some(api);
}

fn with_global<R>(f: impl FnOnce(&ConsumerSessionApi) -> R, fallback: R) -> R {
    let guard = GLOBAL_API.lock().unwrap();
    match guard.as_ref() {
        Some(api) => f(api),
        None => fallback,
    }
}

pub const INVALID_HANDLE: i32 = -1;

/// # Safety
/// `config` must point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ferrotrace_consumer_enable_tracing(
    config: *const u8,
    len: usize,
) -> i32 {
    if config.is_null() {
        return INVALID_HANDLE;
    }
    let bytes = unsafe { std::slice::from_raw_parts(config, len) };
    with_global(
        |api| api.enable_tracing(bytes).unwrap_or(INVALID_HANDLE),
        INVALID_HANDLE,
    )
}

#[unsafe(no_mangle)]
pub extern "C" fn ferrotrace_consumer_start_tracing(handle: i32) {
    with_global(|api| api.start_tracing(handle).is_ok(), false);
}

#[unsafe(no_mangle)]
pub extern "C" fn ferrotrace_consumer_poll_state(handle: i32) -> i32 {
    with_global(
        |api| api.poll_state(handle) as i32,
        ConsumerState::SessionNotFound as i32,
    )
}

/// # Safety
/// `out_len` must be a valid pointer. The returned buffer stays valid
/// until `ferrotrace_consumer_destroy(handle)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ferrotrace_consumer_read_trace(
    handle: i32,
    wait_ms: i32,
    out_len: *mut usize,
) -> *const u8 {
    let wait = (wait_ms > 0).then(|| Duration::from_millis(wait_ms as u64));
    let ptr = with_global(
        |api| {
            let Ok(session) = api.session(handle) else {
                return (std::ptr::null(), 0);
            };
            if wait.is_some() {
                api.read_trace(handle, wait);
            }
            match session.final_trace.get() {
                Some(trace) => (trace.as_ptr(), trace.len()),
                None => (std::ptr::null(), 0),
            }
        },
        (std::ptr::null(), 0),
    );
    if !out_len.is_null() {
        unsafe { *out_len = ptr.1 };
    }
    ptr.0
}

#[unsafe(no_mangle)]
pub extern "C" fn ferrotrace_consumer_destroy(handle: i32) {
    with_global(|api| api.destroy(handle), ());
}
