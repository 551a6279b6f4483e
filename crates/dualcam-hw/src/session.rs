//! One open USB camera endpoint.
//!
//! A session binds the OS control handle, owns the frame-callback slot and
//! drives the transport's streaming. Callback delivery goes through a gate
//! that lets `stop_preview` wait out an in-flight frame before the
//! transport is halted, so no callback fires after `stop_preview` returns.

use crate::sync::lock;
use crate::usb::{ControlHandle, FrameSink, SensorChannel, TransportError, UsbId, UvcTransport};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;

/// Time the driver needs after a stream stop before the handle may be
/// closed, so in-flight USB transfers can drain.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Per-frame callback registered through `start_preview`.
pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Hardware-reported faults escalated out of the capture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFault {
    /// A zero-length frame arrived; the device should be reopened.
    RestartRequested,
}

pub type FaultHook = Arc<dyn Fn(UsbId, SensorChannel, SessionFault) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Previewing,
    /// Retired after a detach or disconnect. Terminal.
    Dead,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already open")]
    AlreadyOpen,
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("session is dead")]
    SessionDead,
    #[error("session not open")]
    NotOpen,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is running a session frame callback.
///
/// Anything reachable from a frame listener that would block on a lock held
/// across a drain checks this first.
pub fn in_frame_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// Clears the dispatch marks when a callback returns or unwinds.
struct DispatchMark<'a> {
    gate: &'a CallbackGate,
    outer: bool,
}

impl Drop for DispatchMark<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.dispatcher) = None;
        IN_CALLBACK.with(|c| c.set(self.outer));
    }
}

/// Callback slot plus the in-flight marker used to drain it.
struct CallbackGate {
    callback: Mutex<Option<FrameCallback>>,
    in_flight: Mutex<()>,
    dispatcher: Mutex<Option<ThreadId>>,
}

impl CallbackGate {
    fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            in_flight: Mutex::new(()),
            dispatcher: Mutex::new(None),
        }
    }

    fn dispatch(&self, frame: &[u8]) {
        let _flight = lock(&self.in_flight);
        let Some(callback) = lock(&self.callback).clone() else {
            return;
        };
        *lock(&self.dispatcher) = Some(thread::current().id());
        let _mark = DispatchMark {
            gate: self,
            outer: IN_CALLBACK.with(|c| c.replace(true)),
        };
        callback(frame);
    }

    fn replace(&self, callback: Option<FrameCallback>) {
        *lock(&self.callback) = callback;
    }

    /// Whether the calling thread is currently inside a callback.
    fn dispatching_here(&self) -> bool {
        *lock(&self.dispatcher) == Some(thread::current().id())
    }

    /// Clear the slot and wait until any in-flight callback has returned.
    /// From inside a callback there is nothing to wait for.
    fn drain(&self) {
        self.replace(None);
        if !self.dispatching_here() {
            drop(lock(&self.in_flight));
        }
    }
}

pub struct DeviceSession {
    id: UsbId,
    channel: SensorChannel,
    transport: Arc<dyn UvcTransport>,
    state: Mutex<SessionState>,
    /// Serializes open/start/stop/close. Never taken on the capture path.
    ops: Mutex<()>,
    gate: Arc<CallbackGate>,
    fault_hook: Option<FaultHook>,
    frames: Arc<AtomicU64>,
}

impl DeviceSession {
    pub fn new(id: UsbId, channel: SensorChannel, transport: Arc<dyn UvcTransport>) -> Self {
        Self {
            id,
            channel,
            transport,
            state: Mutex::new(SessionState::Closed),
            ops: Mutex::new(()),
            gate: Arc::new(CallbackGate::new()),
            fault_hook: None,
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Route hardware faults (zero-length frames) to `hook`.
    pub fn with_fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    pub fn id(&self) -> UsbId {
        self.id
    }

    pub fn channel(&self) -> SensorChannel {
        self.channel
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Non-empty frames received from the transport since creation.
    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn open(&self, handle: &ControlHandle) -> Result<(), SessionError> {
        let _ops = lock(&self.ops);
        match self.state() {
            SessionState::Dead => return Err(SessionError::SessionDead),
            SessionState::Open | SessionState::Previewing => return Err(SessionError::AlreadyOpen),
            SessionState::Closed => {}
        }
        self.transport
            .open(handle)
            .map_err(|e| SessionError::DeviceBusy(e.to_string()))?;
        *lock(&self.state) = SessionState::Open;
        tracing::info!(device = %self.id, channel = %self.channel, "session opened");
        Ok(())
    }

    /// Register `callback` and start streaming. While already previewing,
    /// only the callback is replaced; the stream keeps running.
    pub fn start_preview(&self, callback: FrameCallback) -> Result<(), SessionError> {
        let _ops = lock(&self.ops);
        match self.state() {
            SessionState::Dead => Err(SessionError::SessionDead),
            SessionState::Closed => Err(SessionError::NotOpen),
            SessionState::Previewing => {
                self.gate.replace(Some(callback));
                tracing::debug!(device = %self.id, channel = %self.channel, "frame callback replaced");
                Ok(())
            }
            SessionState::Open => {
                self.gate.replace(Some(callback));
                if let Err(e) = self.transport.start_streaming(self.sink()) {
                    self.gate.replace(None);
                    return Err(e.into());
                }
                *lock(&self.state) = SessionState::Previewing;
                tracing::info!(device = %self.id, channel = %self.channel, "preview started");
                Ok(())
            }
        }
    }

    /// Deregister the callback, halt streaming and wait the settle delay.
    ///
    /// Blocks until an in-flight callback has returned; may be called from
    /// inside the callback itself. A no-op unless previewing.
    pub fn stop_preview(&self) -> Result<(), SessionError> {
        let _ops = if self.gate.dispatching_here() {
            None
        } else {
            Some(lock(&self.ops))
        };
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Dead => return Err(SessionError::SessionDead),
                SessionState::Closed | SessionState::Open => return Ok(()),
                SessionState::Previewing => *state = SessionState::Open,
            }
        }
        self.halt();
        tracing::info!(device = %self.id, channel = %self.channel, "preview stopped");
        Ok(())
    }

    /// Release the control handle, stopping preview first if needed.
    /// A no-op on a closed session.
    pub fn close(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Dead => return Err(SessionError::SessionDead),
            SessionState::Closed => return Ok(()),
            SessionState::Previewing => self.stop_preview()?,
            SessionState::Open => {}
        }
        let _ops = lock(&self.ops);
        let mut state = lock(&self.state);
        if *state == SessionState::Open {
            self.transport.close();
            *state = SessionState::Closed;
            tracing::info!(device = %self.id, channel = %self.channel, "session closed");
        }
        Ok(())
    }

    /// Tear everything down and mark the session dead. Used when the state
    /// instance that owns it ends; never fails.
    pub(crate) fn retire(&self) {
        let _ops = if self.gate.dispatching_here() {
            None
        } else {
            Some(lock(&self.ops))
        };
        let previous = std::mem::replace(&mut *lock(&self.state), SessionState::Dead);
        match previous {
            SessionState::Previewing => {
                self.halt();
                self.transport.close();
            }
            SessionState::Open => self.transport.close(),
            SessionState::Closed | SessionState::Dead => {}
        }
        if previous != SessionState::Dead {
            tracing::debug!(device = %self.id, channel = %self.channel, "session retired");
        }
    }

    fn halt(&self) {
        self.gate.drain();
        self.transport.stop_streaming();
        thread::sleep(SETTLE_DELAY);
    }

    fn sink(&self) -> FrameSink {
        let gate = Arc::clone(&self.gate);
        let hook = self.fault_hook.clone();
        let frames = Arc::clone(&self.frames);
        let (id, channel) = (self.id, self.channel);
        Arc::new(move |frame: &[u8]| {
            if frame.is_empty() {
                tracing::warn!(device = %id, %channel, "zero-length frame; restart requested");
                if let Some(hook) = &hook {
                    hook(id, channel, SessionFault::RestartRequested);
                }
                return;
            }
            frames.fetch_add(1, Ordering::Relaxed);
            gate.dispatch(frame);
        })
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Transport that delivers frames synchronously on the caller's thread.
    #[derive(Default)]
    struct LoopbackTransport {
        sink: Mutex<Option<FrameSink>>,
        fail_open: bool,
        closes: AtomicUsize,
        starts: AtomicUsize,
    }

    impl LoopbackTransport {
        fn push(&self, frame: &[u8]) {
            let sink = lock(&self.sink).clone();
            if let Some(sink) = sink {
                sink(frame);
            }
        }
    }

    impl UvcTransport for LoopbackTransport {
        fn open(&self, _handle: &ControlHandle) -> Result<(), TransportError> {
            if self.fail_open {
                Err(TransportError::Busy("EBUSY".into()))
            } else {
                Ok(())
            }
        }

        fn start_streaming(&self, sink: FrameSink) -> Result<(), TransportError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *lock(&self.sink) = Some(sink);
            Ok(())
        }

        fn stop_streaming(&self) {
            *lock(&self.sink) = None;
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    const ID: UsbId = UsbId::new(0x0bda, 0x5830);

    fn session(transport: &Arc<LoopbackTransport>) -> DeviceSession {
        DeviceSession::new(ID, SensorChannel::Ir, Arc::clone(transport) as Arc<dyn UvcTransport>)
    }

    fn counter() -> (Arc<AtomicUsize>, FrameCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Arc::new(move |_frame: &[u8]| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_open_twice_is_already_open() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = session(&transport);
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        assert_eq!(
            s.open(&ControlHandle::single("/dev/video0")),
            Err(SessionError::AlreadyOpen)
        );
    }

    #[test]
    fn test_open_failure_is_device_busy() {
        let transport = Arc::new(LoopbackTransport {
            fail_open: true,
            ..Default::default()
        });
        let s = session(&transport);
        let err = s.open(&ControlHandle::single("/dev/video0")).unwrap_err();
        assert!(matches!(err, SessionError::DeviceBusy(_)));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_start_preview_requires_open() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = session(&transport);
        let (_, cb) = counter();
        assert_eq!(s.start_preview(cb), Err(SessionError::NotOpen));
    }

    #[test]
    fn test_start_preview_twice_replaces_callback_without_restart() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = session(&transport);
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        let (first, cb1) = counter();
        let (second, cb2) = counter();
        s.start_preview(cb1).unwrap();
        transport.push(&[1, 2, 3]);
        s.start_preview(cb2).unwrap();
        transport.push(&[1, 2, 3]);

        assert_eq!(transport.starts.load(Ordering::SeqCst), 1);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(s.frames_delivered(), 2);
    }

    #[test]
    fn test_stop_preview_deregisters_callback() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = session(&transport);
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        let (count, cb) = counter();
        s.start_preview(cb).unwrap();
        let sink = lock(&transport.sink).clone().unwrap();
        s.stop_preview().unwrap();

        // A delivery racing the stop finds the slot empty.
        sink(&[9, 9]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(s.state(), SessionState::Open);
    }

    #[test]
    fn test_close_is_idempotent() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = session(&transport);
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        s.close().unwrap();
        s.close().unwrap();
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_dead_session_rejects_everything() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = session(&transport);
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        s.retire();
        let (_, cb) = counter();
        assert_eq!(s.open(&ControlHandle::single("/dev/video0")), Err(SessionError::SessionDead));
        assert_eq!(s.start_preview(cb), Err(SessionError::SessionDead));
        assert_eq!(s.stop_preview(), Err(SessionError::SessionDead));
        assert_eq!(s.close(), Err(SessionError::SessionDead));
    }

    #[test]
    fn test_zero_length_frames_each_request_restart() {
        let transport = Arc::new(LoopbackTransport::default());
        let faults = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&faults);
        let s = session(&transport).with_fault_hook(Arc::new(move |id, channel, fault| {
            assert_eq!(id, ID);
            assert_eq!(channel, SensorChannel::Ir);
            assert_eq!(fault, SessionFault::RestartRequested);
            f.fetch_add(1, Ordering::SeqCst);
        }));
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        let (count, cb) = counter();
        s.start_preview(cb).unwrap();

        transport.push(&[]);
        transport.push(&[]);
        transport.push(&[7]);

        assert_eq!(faults.load(Ordering::SeqCst), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_marks_its_thread() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = session(&transport);
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&seen);
        s.start_preview(Arc::new(move |_frame: &[u8]| {
            if in_frame_callback() {
                c.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();
        assert!(!in_frame_callback());
        transport.push(&[1]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!in_frame_callback());
    }

    #[test]
    fn test_stop_preview_from_inside_callback() {
        let transport = Arc::new(LoopbackTransport::default());
        let s = Arc::new(session(&transport));
        s.open(&ControlHandle::single("/dev/video0")).unwrap();
        let weak = Arc::downgrade(&s);
        s.start_preview(Arc::new(move |_frame: &[u8]| {
            if let Some(s) = weak.upgrade() {
                s.stop_preview().unwrap();
            }
        }))
        .unwrap();
        transport.push(&[1]);
        assert_eq!(s.state(), SessionState::Open);
    }
}
