use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::command::{Command, Retired};
use crate::engine::{self, CycleControl, CycleStats, EngineHandle, ProcessCycleEngine, StartProgress};
use crate::error::{Callback, ExecutionFailure, Failure, FailureCause, FailureOrigin, StateError};
use crate::info::{Architecture, PortInfo};
use crate::listener::{
    guarded, panic_message, InputPortListener, NoopSystemListener, OutputPortListener,
    SystemListener,
};
use crate::port::{ActivePort, MidiPort, PortListener, PortState};
use crate::registry::{self, PortRegistry};
use crate::transport::{DriverExit, Transport};
use crate::{Direction, Error, PortId, Result};

pub const CYCLE_THREAD_NAME: &str = "midicycle-process";

pub type CycleTask = Box<dyn FnOnce() -> DriverExit + Send + 'static>;

/// Creates the thread that runs the cycles of a started system.
pub trait ThreadFactory: Send {
    fn spawn(&mut self, name: &str, task: CycleTask) -> std::io::Result<JoinHandle<DriverExit>>;
}

#[derive(Debug, Default)]
pub struct StdThreadFactory;

impl ThreadFactory for StdThreadFactory {
    fn spawn(&mut self, name: &str, task: CycleTask) -> std::io::Result<JoinHandle<DriverExit>> {
        thread::Builder::new().name(name.to_string()).spawn(task)
    }
}

#[derive(Clone, Debug)]
pub struct SystemConfig {
    /// Capacity of the queue carrying port changes to the cycle thread.
    pub command_queue_size: usize,
    /// Events a port can receive or send per cycle.
    pub max_events_per_cycle: usize,
    /// How long `start` waits for the first cycle.
    pub start_timeout: Duration,
    /// How long closing waits for the cycle thread to acknowledge.
    pub stop_timeout: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            command_queue_size: 4096,
            max_events_per_cycle: 255,
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenState {
    Closed,
    Open,
    Running,
}

pub(crate) struct SessionShared {
    state: Mutex<Session>,
}

struct Session {
    open_state: OpenState,
    client_name: Option<String>,
    config: SystemConfig,
    transport: Box<dyn Transport>,
    registry: PortRegistry,
    control: Arc<CycleControl>,
    engine: Option<ProcessCycleEngine>,
    handle: EngineHandle,
    cycle_thread: Option<JoinHandle<DriverExit>>,
    thread_factory: Box<dyn ThreadFactory>,
    failures: Vec<Failure>,
}

/// A client session with one native server.
///
/// ```text
/// Closed --open()--> Open --start()--> Running --close()--> Closed
/// ```
///
/// Handles are cheap to clone and all refer to the same session. Control
/// calls are serialized by a session wide lock; none of them may be made
/// from inside a listener callback running on the cycle thread.
#[derive(Clone)]
pub struct MidiSystem {
    shared: Arc<SessionShared>,
}

impl MidiSystem {
    pub fn new(transport: Box<dyn Transport>, config: SystemConfig) -> MidiSystem {
        let control = Arc::new(CycleControl::new());
        let (engine, handle) = engine::channel(control.clone(), config.command_queue_size);
        let session = Session {
            open_state: OpenState::Closed,
            client_name: None,
            config,
            transport,
            registry: PortRegistry::new(),
            control,
            engine: Some(engine),
            handle,
            cycle_thread: None,
            thread_factory: Box::new(StdThreadFactory),
            failures: Vec::new(),
        };
        MidiSystem {
            shared: Arc::new(SessionShared {
                state: Mutex::new(session),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> MidiSystem {
        MidiSystem { shared }
    }

    pub fn architecture(&self) -> Option<Architecture> {
        self.lock().transport.architecture()
    }

    pub fn is_available(&self) -> bool {
        self.lock().transport.is_available()
    }

    pub fn open_state(&self) -> OpenState {
        self.lock().open_state
    }

    pub fn is_open(&self) -> bool {
        self.open_state() != OpenState::Closed
    }

    pub fn is_running(&self) -> bool {
        self.open_state() == OpenState::Running
    }

    pub fn client_name(&self) -> Option<String> {
        self.lock().client_name.clone()
    }

    pub fn cycle_stats(&self) -> CycleStats {
        self.lock().control.stats()
    }

    /// Connects to the server as `client_name`.
    ///
    /// Ports created while the system was closed are registered with the
    /// server now. The listener's `on_open` runs on this thread; a failure
    /// there is reported when the system closes.
    pub fn open(
        &self,
        client_name: &str,
        listener: Box<dyn SystemListener>,
        thread_factory: Box<dyn ThreadFactory>,
    ) -> Result<()> {
        let mut session = self.lock();
        if session.open_state != OpenState::Closed {
            return Err(StateError::AlreadyOpen.into());
        }
        if client_name.is_empty() {
            return Err(Error::InvalidArgument(
                "client name must not be empty".to_string(),
            ));
        }
        if !session.transport.is_available() {
            return match session.transport.architecture() {
                Some(architecture) => Err(Error::Unavailable(architecture)),
                None => Err(Error::InvalidArgument(
                    "transport is not available".to_string(),
                )),
            };
        }
        session.transport.open(client_name)?;
        if let Err(e) = session.register_pending_ports() {
            if let Err(close_error) = session.transport.close() {
                warn!("Could not close the transport: {}", close_error);
            }
            return Err(e);
        }

        let mut listener = listener;
        if let Err(cause) = guarded(|| listener.on_open()) {
            let failure = Failure::new(FailureOrigin::System(Callback::Open), cause);
            error!("{}", failure);
            session.failures.push(failure);
        }
        session.control.reset();
        session.engine_mut().set_listener(listener);
        session.thread_factory = thread_factory;
        session.client_name = Some(client_name.to_string());
        session.open_state = OpenState::Open;
        info!(
            "Opened midi system {:?} as {}.",
            session.transport.architecture(),
            client_name
        );
        Ok(())
    }

    /// Opens with a listener that ignores every notification and the
    /// standard thread factory.
    pub fn open_default(&self, client_name: &str) -> Result<()> {
        self.open(
            client_name,
            Box::new(NoopSystemListener),
            Box::new(StdThreadFactory),
        )
    }

    pub fn create_input_port(
        &self,
        name: &str,
        listener: Box<dyn InputPortListener>,
    ) -> Result<MidiPort> {
        self.create_port(name, PortListener::Input(listener))
    }

    pub fn create_output_port(
        &self,
        name: &str,
        listener: Box<dyn OutputPortListener>,
    ) -> Result<MidiPort> {
        self.create_port(name, PortListener::Output(listener))
    }

    /// Starts the cycle thread and returns once its first cycle completed.
    pub fn start(&self) -> Result<()> {
        let mut session = self.lock();
        if session.open_state != OpenState::Open {
            return Err(StateError::NotRunnable.into());
        }
        let engine = session.engine.take().ok_or(StateError::NotRunnable)?;
        let driver = match session.transport.driver() {
            Ok(driver) => driver,
            Err(e) => {
                session.engine = Some(engine);
                return Err(e.into());
            }
        };

        session.control.reset();
        let control = session.control.clone();
        let slot = Arc::new(Mutex::new(Some(engine)));
        let task_slot = slot.clone();
        let task: CycleTask = Box::new(move || {
            let engine = task_slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let exit = match engine {
                Some(engine) => driver.run(engine),
                None => DriverExit {
                    engine: None,
                    result: Ok(()),
                },
            };
            control.mark_exited();
            exit
        });
        match session.thread_factory.spawn(CYCLE_THREAD_NAME, task) {
            Ok(handle) => session.cycle_thread = Some(handle),
            Err(e) => {
                session.engine = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                session.restore_engine();
                return Err(Error::Spawn(e));
            }
        }
        session.open_state = OpenState::Running;

        let timeout = session.config.start_timeout;
        match session.control.wait_first_cycle(timeout) {
            StartProgress::Running => {
                info!("Midi system is running.");
                Ok(())
            }
            StartProgress::Exited => {
                session.open_state = OpenState::Open;
                let failure = session.stop_cycle_thread().err();
                session.control.reset();
                Err(match failure {
                    Some(Failure {
                        cause: FailureCause::Transport(e),
                        ..
                    }) => Error::Transport(e),
                    Some(failure) => Error::Execution(failure.into()),
                    None => Error::Unresponsive(timeout),
                })
            }
            StartProgress::TimedOut => {
                warn!("No cycle completed within {:?}.", timeout);
                Err(Error::Unresponsive(timeout))
            }
        }
    }

    /// Stops processing, closes every port and disconnects.
    ///
    /// Every failure captured since `open` is returned here as one
    /// [`Error::Execution`]. The system is closed afterwards in any case.
    pub fn close(&self) -> Result<()> {
        let mut session = self.lock();
        if session.open_state == OpenState::Closed {
            return Err(StateError::NotOpen.into());
        }
        let mut cycle_failure = None;
        if session.open_state == OpenState::Running {
            cycle_failure = session.stop_cycle_thread().err();
        }

        let engine = session.engine_mut();
        engine.handle_command_queue();
        engine.close_all();
        let listener = engine.take_listener();
        let listener_failures = engine.take_failures();
        // Retired entries only exist for closes that gave up waiting.
        while session.handle.retired.pop().is_some() {}

        let mut failures = Vec::new();
        let ids: Vec<PortId> = session.registry.iter().map(|p| p.id()).collect();
        for state in session.registry.drain().collect::<Vec<_>>() {
            state.mark_closed();
            failures.extend(state.take_failure());
        }
        for id in ids {
            if let Err(e) = session.transport.unregister_port(id) {
                warn!("Could not unregister port {}: {}", id, e);
            }
        }

        failures.append(&mut session.failures);
        failures.extend(listener_failures);
        if let Some(mut listener) = listener {
            if let Err(cause) = guarded(|| listener.on_close()) {
                let failure = Failure::new(FailureOrigin::System(Callback::Close), cause);
                error!("{}", failure);
                failures.push(failure);
            }
        }
        failures.extend(cycle_failure);
        if let Err(e) = session.transport.close() {
            failures.push(Failure::new(FailureOrigin::Transport, e.into()));
        }

        session.open_state = OpenState::Closed;
        session.client_name = None;
        info!("Closed midi system {:?}.", session.transport.architecture());
        match ExecutionFailure::from_failures(failures) {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    /// Sources on the server that inputs can be connected to.
    pub fn input_port_infos(&self) -> Result<Vec<PortInfo>> {
        self.server_ports(Direction::Input)
    }

    /// Sinks on the server that outputs can be connected to.
    pub fn output_port_infos(&self) -> Result<Vec<PortInfo>> {
        self.server_ports(Direction::Output)
    }

    fn server_ports(&self, direction: Direction) -> Result<Vec<PortInfo>> {
        let session = self.lock();
        if session.open_state == OpenState::Closed {
            return Err(StateError::NotOpen.into());
        }
        Ok(session.transport.server_ports(direction)?)
    }

    fn create_port(&self, name: &str, listener: PortListener) -> Result<MidiPort> {
        let mut session = self.lock();
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "port name must not be empty".to_string(),
            ));
        }
        if session.registry.contains_name(name) {
            return Err(Error::InvalidArgument(format!(
                "a port named \"{}\" already exists",
                name
            )));
        }
        let direction = listener.direction();
        let id = registry::next_port_id();
        let info = session.transport.describe_port(name, direction);
        let state = Arc::new(PortState::new(id, name, direction, info));
        let creation_error = |source: FailureCause| Error::Creation {
            name: name.to_string(),
            source,
        };

        let registered = session.open_state != OpenState::Closed;
        if registered {
            session
                .transport
                .register_port(id, name, direction)
                .map_err(|e| creation_error(e.into()))?;
        }
        let mut port = ActivePort::new(
            state.clone(),
            listener,
            session.config.max_events_per_cycle,
        );
        if let Err(cause) = port.open() {
            session.release_native_port(registered, id);
            return Err(creation_error(cause));
        }
        if let Err(Command::AddPort(mut port)) = session.handle.commands.push(Command::AddPort(port))
        {
            if let Err(failure) = port.close() {
                warn!("{}", failure);
            }
            session.release_native_port(registered, id);
            return Err(creation_error(FailureCause::CommandQueueFull));
        }
        session.registry.register(state.clone());
        session.apply_when_idle();
        info!("Created {:?} port \"{}\" with id {}.", direction, name, id);
        Ok(MidiPort::new(state, Arc::downgrade(&self.shared)))
    }

    pub(crate) fn close_port(&self, id: PortId) -> Result<()> {
        let mut session = self.lock();
        let state = session
            .registry
            .get(id)
            .cloned()
            .ok_or(Error::PortClosed(id))?;
        if session.handle.commands.push(Command::ClosePort(id)).is_err() {
            return Err(Error::CommandQueueFull);
        }
        session.apply_when_idle();
        let retired = session.await_retired(id)?;

        session.registry.unregister(id);
        let registered = session.open_state != OpenState::Closed;
        session.release_native_port(registered, id);

        let mut failures: Vec<Failure> = state.take_failure().into_iter().collect();
        if let Some(mut port) = retired.port {
            if let Err(failure) = port.close() {
                error!("{}", failure);
                failures.push(failure);
            }
        }
        state.mark_closed();
        info!("Closed port \"{}\".", state.name());
        match ExecutionFailure::from_failures(failures) {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for MidiSystem {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for MidiSystem {}

impl fmt::Debug for MidiSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let session = self.lock();
        f.debug_struct("MidiSystem")
            .field("architecture", &session.transport.architecture())
            .field("open_state", &session.open_state)
            .field("client_name", &session.client_name)
            .field("ports", &session.registry.len())
            .finish()
    }
}

impl Session {
    fn engine_mut(&mut self) -> &mut ProcessCycleEngine {
        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => self.replacement_engine(),
        };
        self.engine.insert(engine)
    }

    fn restore_engine(&mut self) {
        if self.engine.is_none() {
            self.engine = Some(self.replacement_engine());
        }
    }

    /// Builds a fresh engine after the cycle thread failed to hand back its
    /// own. The listeners of the live ports are gone with it, so those ports
    /// are closed.
    fn replacement_engine(&mut self) -> ProcessCycleEngine {
        error!("The process thread did not hand back its ports.");
        for state in self.registry.iter() {
            state.mark_closed();
        }
        let (engine, handle) =
            engine::channel(self.control.clone(), self.config.command_queue_size);
        self.handle = handle;
        engine
    }

    fn apply_when_idle(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.handle_command_queue();
        }
    }

    fn register_pending_ports(&mut self) -> Result<()> {
        let pending: Vec<(PortId, String, Direction)> = self
            .registry
            .iter()
            .filter(|p| !p.is_closed())
            .map(|p| (p.id(), p.name().to_string(), p.direction()))
            .collect();
        for (done, (id, name, direction)) in pending.iter().enumerate() {
            if let Err(e) = self.transport.register_port(*id, name, *direction) {
                for (id, _, _) in &pending[..done] {
                    if let Err(e) = self.transport.unregister_port(*id) {
                        warn!("Could not unregister port {}: {}", id, e);
                    }
                }
                return Err(Error::Creation {
                    name: name.clone(),
                    source: e.into(),
                });
            }
        }
        Ok(())
    }

    fn release_native_port(&mut self, registered: bool, id: PortId) {
        if !registered {
            return;
        }
        if let Err(e) = self.transport.unregister_port(id) {
            warn!("Could not unregister port {}: {}", id, e);
        }
    }

    /// Waits for the engine to answer a close command.
    fn await_retired(&mut self, id: PortId) -> Result<Retired> {
        let timeout = self.config.stop_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(retired) = self.handle.retired.pop() {
                if retired.id == id {
                    return Ok(retired);
                }
                warn!("Dropping stale answer for port {}.", retired.id);
            }
            let thread_gone = self
                .cycle_thread
                .as_ref()
                .map_or(true, JoinHandle::is_finished);
            if thread_gone || Instant::now() >= deadline {
                return Err(Error::Unresponsive(timeout));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Asks the cycle thread for a last cycle and joins it.
    fn stop_cycle_thread(&mut self) -> std::result::Result<(), Failure> {
        self.control.request_stop();
        let handle = match self.cycle_thread.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let result = match handle.join() {
            Ok(exit) => {
                self.engine = exit.engine;
                exit.result
                    .map_err(|e| Failure::new(FailureOrigin::CycleThread, e.into()))
            }
            Err(payload) => Err(Failure::new(
                FailureOrigin::CycleThread,
                FailureCause::Panic(panic_message(payload.as_ref())),
            )),
        };
        self.restore_engine();
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.cycle_thread.is_some() {
            if let Err(failure) = self.stop_cycle_thread() {
                error!("{}", failure);
            }
        }
        if self.open_state != OpenState::Closed {
            if let Err(e) = self.transport.close() {
                warn!("Could not close the transport: {}", e);
            }
        }
    }
}
