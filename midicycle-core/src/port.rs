use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::error;

use crate::buffer::RawEventBuffer;
use crate::codec::TimedEvent;
use crate::error::{Callback, Failure, FailureCause, FailureOrigin};
use crate::info::PortInfo;
use crate::listener::{guarded, InputPortListener, ListenerResult, OutputPortListener};
use crate::session::{MidiSystem, SessionShared};
use crate::transport::CycleIo;
use crate::{CycleWindow, Direction, Error, PortId, Result};

/// Identity and status of a port, shared between the session, the cycle
/// thread and the application's [`MidiPort`] handle.
pub struct PortState {
    id: PortId,
    name: String,
    direction: Direction,
    info: PortInfo,
    closed: AtomicBool,
    failure: Mutex<Option<Failure>>,
}

impl PortState {
    pub(crate) fn new(id: PortId, name: &str, direction: Direction, info: PortInfo) -> PortState {
        PortState {
            id,
            name: name.to_string(),
            direction,
            info,
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Records `failure` unless an earlier one is pending.
    pub(crate) fn capture(&self, failure: Failure) {
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    pub(crate) fn take_failure(&self) -> Option<Failure> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn failure(&self, callback: Callback, cause: FailureCause) -> Failure {
        Failure::new(
            FailureOrigin::Port {
                id: self.id,
                name: self.name.clone(),
                callback,
            },
            cause,
        )
    }
}

impl fmt::Debug for PortState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PortState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub enum PortListener {
    Input(Box<dyn InputPortListener>),
    Output(Box<dyn OutputPortListener>),
}

impl PortListener {
    pub fn direction(&self) -> Direction {
        match self {
            PortListener::Input(_) => Direction::Input,
            PortListener::Output(_) => Direction::Output,
        }
    }

    fn on_open(&mut self) -> ListenerResult {
        match self {
            PortListener::Input(l) => l.on_open(),
            PortListener::Output(l) => l.on_open(),
        }
    }

    fn on_close(&mut self) -> ListenerResult {
        match self {
            PortListener::Input(l) => l.on_close(),
            PortListener::Output(l) => l.on_close(),
        }
    }
}

/// A port in the live set of the engine, together with its listener and
/// the scratch storage used while processing it.
pub struct ActivePort {
    state: Arc<PortState>,
    listener: PortListener,
    buffer: RawEventBuffer,
    events: Vec<TimedEvent>,
}

impl ActivePort {
    pub(crate) fn new(state: Arc<PortState>, listener: PortListener, capacity: usize) -> ActivePort {
        ActivePort {
            state,
            listener,
            buffer: RawEventBuffer::new(capacity),
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn id(&self) -> PortId {
        self.state.id
    }

    pub fn direction(&self) -> Direction {
        self.listener.direction()
    }

    pub fn state(&self) -> &Arc<PortState> {
        &self.state
    }

    pub(crate) fn open(&mut self) -> std::result::Result<(), FailureCause> {
        let listener = &mut self.listener;
        guarded(|| listener.on_open())
    }

    /// Fires `on_close` and marks the port closed, even when `on_close` fails.
    pub(crate) fn close(&mut self) -> std::result::Result<(), Failure> {
        let listener = &mut self.listener;
        let result = guarded(|| listener.on_close());
        self.state.mark_closed();
        result.map_err(|cause| self.state.failure(Callback::Close, cause))
    }

    /// Processes one cycle. Returns false once the port failed and left the
    /// live set.
    pub(crate) fn process(&mut self, window: &CycleWindow, io: &mut dyn CycleIo) -> bool {
        let id = self.state.id;
        self.events.clear();
        let result = match &mut self.listener {
            PortListener::Input(listener) => io
                .read_input(id, &mut self.buffer)
                .and_then(|()| self.buffer.decode_into(&mut self.events))
                .map_err(FailureCause::from)
                .and_then(|_| guarded(|| listener.process(window, &self.events))),
            PortListener::Output(listener) => guarded(|| listener.process(window, &mut self.events))
                .and_then(|()| {
                    self.buffer
                        .encode_from(&self.events, window.time_code_duration)
                        .map_err(FailureCause::from)
                })
                .and_then(|_| io.write_output(id, &self.buffer).map_err(FailureCause::from)),
        };
        match result {
            Ok(()) => true,
            Err(cause) => {
                self.fail(Callback::Process, cause);
                false
            }
        }
    }

    /// Closes the port because one of its callbacks failed. The first
    /// failure stays attached to the port until someone collects it.
    pub(crate) fn fail(&mut self, callback: Callback, cause: FailureCause) {
        let failure = self.state.failure(callback, cause);
        error!("{}", failure);
        self.state.capture(failure);
        if let Err(failure) = self.close() {
            error!("{}", failure);
            self.state.capture(failure);
        }
    }
}

/// Handle to a port owned by a [`MidiSystem`].
pub struct MidiPort {
    state: Arc<PortState>,
    system: Weak<SessionShared>,
}

impl MidiPort {
    pub(crate) fn new(state: Arc<PortState>, system: Weak<SessionShared>) -> MidiPort {
        MidiPort { state, system }
    }

    pub fn id(&self) -> PortId {
        self.state.id
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn direction(&self) -> Direction {
        self.state.direction
    }

    pub fn info(&self) -> &PortInfo {
        &self.state.info
    }

    /// True after an explicit close, after the owning system closed, or
    /// after one of the port's own callbacks failed.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Closes the port, firing the listener's `on_close` on this thread.
    ///
    /// A failure captured while the port was processing is returned here and
    /// is then no longer reported when the system closes. Closing a port a
    /// second time yields [`Error::PortClosed`].
    pub fn close(&self) -> Result<()> {
        match self.system.upgrade() {
            Some(shared) => MidiSystem::from_shared(shared).close_port(self.id()),
            None => Err(Error::PortClosed(self.id())),
        }
    }
}

impl fmt::Debug for MidiPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MidiPort")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .field("direction", &self.state.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}
