use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{error, warn};
use ringbuf::{Consumer, Producer, RingBuffer};

use crate::command::{Command, Retired};
use crate::error::{Callback, Failure, FailureOrigin};
use crate::listener::{guarded, SystemListener};
use crate::port::ActivePort;
use crate::transport::CycleIo;
use crate::{CycleWindow, Direction, PortId};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub overruns: u64,
    pub missed_cycles: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StartProgress {
    Running,
    Exited,
    TimedOut,
}

#[derive(Default)]
struct Progress {
    first_cycle_done: bool,
    stop_requested: bool,
    exited: bool,
}

/// Flags shared between the control side, the cycle thread and the
/// transport's notification thread.
#[derive(Default)]
pub struct CycleControl {
    stop: AtomicBool,
    connection_changed: AtomicBool,
    first_cycle_seen: AtomicBool,
    cycles: AtomicU64,
    overruns: AtomicU64,
    missed_cycles: AtomicU64,
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl CycleControl {
    pub fn new() -> CycleControl {
        CycleControl::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.lock_progress().stop_requested = true;
        self.changed.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Blocks until [`CycleControl::request_stop`] has been called.
    pub fn wait_for_stop(&self) {
        let progress = self.lock_progress();
        let _progress = self
            .changed
            .wait_while(progress, |p| !p.stop_requested)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn notify_connection_changed(&self) {
        self.connection_changed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            missed_cycles: self.missed_cycles.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.stop.store(false, Ordering::Release);
        self.connection_changed.store(false, Ordering::Release);
        self.first_cycle_seen.store(false, Ordering::Release);
        self.cycles.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.missed_cycles.store(0, Ordering::Relaxed);
        *self.lock_progress() = Progress::default();
    }

    pub(crate) fn mark_exited(&self) {
        self.lock_progress().exited = true;
        self.changed.notify_all();
    }

    pub(crate) fn wait_first_cycle(&self, timeout: Duration) -> StartProgress {
        let progress = self.lock_progress();
        let (progress, _) = self
            .changed
            .wait_timeout_while(progress, timeout, |p| !p.first_cycle_done && !p.exited)
            .unwrap_or_else(PoisonError::into_inner);
        if progress.first_cycle_done {
            StartProgress::Running
        } else if progress.exited {
            StartProgress::Exited
        } else {
            StartProgress::TimedOut
        }
    }

    fn take_connection_changed(&self) -> bool {
        self.connection_changed.swap(false, Ordering::AcqRel)
    }

    fn cycle_completed(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !self.first_cycle_seen.swap(true, Ordering::AcqRel) {
            self.lock_progress().first_cycle_done = true;
            self.changed.notify_all();
        }
    }

    fn record_overrun(&self, missed: u64) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        self.missed_cycles.fetch_add(missed, Ordering::Relaxed);
    }

    fn lock_progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Control side ends of the engine's queues.
pub struct EngineHandle {
    pub(crate) commands: Producer<Command>,
    pub(crate) retired: Consumer<Retired>,
}

/// Creates an engine together with the queues feeding it.
pub fn channel(
    control: Arc<CycleControl>,
    queue_size: usize,
) -> (ProcessCycleEngine, EngineHandle) {
    let (command_tx, command_rx) = RingBuffer::<Command>::new(queue_size).split();
    let (retired_tx, retired_rx) = RingBuffer::<Retired>::new(queue_size).split();
    let engine = ProcessCycleEngine {
        commands: command_rx,
        retired: retired_tx,
        inputs: Vec::with_capacity(128),
        outputs: Vec::with_capacity(128),
        listener: None,
        listener_failed: false,
        failures: Vec::new(),
        control,
        last_time_code: None,
    };
    let handle = EngineHandle {
        commands: command_tx,
        retired: retired_rx,
    };
    (engine, handle)
}

/// Runs the ports of a session once per cycle.
///
/// Inputs are processed before outputs, each in registration order, between
/// the system listener's `on_cycle_start` and `on_cycle_end`.
pub struct ProcessCycleEngine {
    commands: Consumer<Command>,
    retired: Producer<Retired>,
    inputs: Vec<ActivePort>,
    outputs: Vec<ActivePort>,
    listener: Option<Box<dyn SystemListener>>,
    listener_failed: bool,
    failures: Vec<Failure>,
    control: Arc<CycleControl>,
    last_time_code: Option<u64>,
}

impl ProcessCycleEngine {
    pub fn control(&self) -> &Arc<CycleControl> {
        &self.control
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn process(&mut self, window: CycleWindow, io: &mut dyn CycleIo) {
        self.handle_command_queue();
        self.track_time_code(&window);
        if self.control.take_connection_changed() {
            self.notify_listener(Callback::ConnectionChanged, &window);
        }
        self.notify_listener(Callback::CycleStart, &window);
        self.inputs.retain_mut(|port| port.process(&window, &mut *io));
        self.outputs.retain_mut(|port| port.process(&window, &mut *io));
        self.notify_listener(Callback::CycleEnd, &window);
        if window.is_last_cycle {
            self.close_all();
        }
        self.control.cycle_completed();
    }

    pub(crate) fn handle_command_queue(&mut self) {
        self.commands.pop_each(
            |c| {
                match c {
                    Command::AddPort(port) => match port.direction() {
                        Direction::Input => self.inputs.push(port),
                        Direction::Output => self.outputs.push(port),
                    },
                    Command::ClosePort(id) => {
                        let port = take_port(&mut self.inputs, id)
                            .or_else(|| take_port(&mut self.outputs, id));
                        if self.retired.push(Retired { id, port }).is_err() {
                            error!("Retired queue is full, dropping port {}.", id);
                        }
                    }
                };
                true
            },
            None,
        );
    }

    /// Closes every live port on the calling thread. Failures stay attached
    /// to their ports.
    pub(crate) fn close_all(&mut self) {
        for mut port in self.inputs.drain(..).chain(self.outputs.drain(..)) {
            if let Err(failure) = port.close() {
                error!("{}", failure);
                port.state().capture(failure);
            }
        }
    }

    pub(crate) fn set_listener(&mut self, listener: Box<dyn SystemListener>) {
        self.listener = Some(listener);
        self.listener_failed = false;
        self.last_time_code = None;
    }

    pub(crate) fn take_listener(&mut self) -> Option<Box<dyn SystemListener>> {
        self.listener.take()
    }

    pub(crate) fn take_failures(&mut self) -> Vec<Failure> {
        std::mem::take(&mut self.failures)
    }

    fn track_time_code(&mut self, window: &CycleWindow) {
        let duration = window.time_code_duration;
        if let Some(previous) = self.last_time_code {
            let expected = previous.saturating_add(duration);
            if duration > 0 && window.time_code_start > expected {
                let missed = ((window.time_code_start - expected) / duration).max(1);
                self.control.record_overrun(missed);
                warn!(
                    "Missed {} cycle(s) before time code {}.",
                    missed, window.time_code_start
                );
            }
        }
        self.last_time_code = Some(window.time_code_start);
    }

    fn notify_listener(&mut self, callback: Callback, window: &CycleWindow) {
        if self.listener_failed {
            return;
        }
        let listener = match self.listener.as_mut() {
            Some(listener) => listener,
            None => return,
        };
        let result = guarded(|| match callback {
            Callback::CycleStart => listener.on_cycle_start(window),
            Callback::CycleEnd => listener.on_cycle_end(window),
            Callback::ConnectionChanged => listener.on_connection_changed(),
            Callback::Open => listener.on_open(),
            Callback::Close => listener.on_close(),
            Callback::Process => Ok(()),
        });
        if let Err(cause) = result {
            let failure = Failure::new(FailureOrigin::System(callback), cause);
            error!("{}", failure);
            self.failures.push(failure);
            self.listener_failed = true;
        }
    }
}

impl fmt::Debug for ProcessCycleEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessCycleEngine")
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("listener", &self.listener.is_some())
            .field("failures", &self.failures.len())
            .finish()
    }
}

fn take_port(ports: &mut Vec<ActivePort>, id: PortId) -> Option<ActivePort> {
    let idx = ports.iter().position(|p| p.id() == id)?;
    Some(ports.remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RawEventBuffer;
    use crate::codec::{CodecError, ShortMessage, TimedEvent};
    use crate::error::FailureCause;
    use crate::info::PortInfo;
    use crate::listener::{InputPortListener, ListenerResult, OutputPortListener};
    use crate::port::{PortListener, PortState};
    use crate::registry::next_port_id;
    use crate::transport::TransportError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeIo {
        inputs: HashMap<PortId, Vec<(u32, Vec<u8>)>>,
        written: Vec<(PortId, u32, Vec<u8>)>,
    }

    impl CycleIo for FakeIo {
        fn read_input(&mut self, port: PortId, buffer: &mut RawEventBuffer) -> Result<(), CodecError> {
            buffer.clear();
            for (frame, data) in self.inputs.get(&port).into_iter().flatten() {
                buffer.push(*frame, data)?;
            }
            Ok(())
        }

        fn write_output(&mut self, port: PortId, buffer: &RawEventBuffer) -> Result<(), TransportError> {
            for event in buffer.iter() {
                self.written.push((port, event.frame, event.data.to_vec()));
            }
            Ok(())
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail_at: Option<u64>,
    }

    impl Recorder {
        fn record(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, what));
        }
    }

    impl InputPortListener for Recorder {
        fn process(&mut self, window: &CycleWindow, events: &[TimedEvent]) -> ListenerResult {
            self.record(&format!("in{}", events.len()));
            if Some(window.time_code_start) == self.fail_at {
                return Err("input failure".into());
            }
            Ok(())
        }

        fn on_close(&mut self) -> ListenerResult {
            self.record("close");
            Ok(())
        }
    }

    struct Sender {
        name: &'static str,
        log: Log,
        tick: u32,
    }

    impl OutputPortListener for Sender {
        fn process(&mut self, _window: &CycleWindow, events: &mut Vec<TimedEvent>) -> ListenerResult {
            self.log.lock().unwrap().push(format!("{}:out", self.name));
            events.push(TimedEvent::new(self.tick, ShortMessage::new(0x90, 60, 100)));
            Ok(())
        }

        fn on_close(&mut self) -> ListenerResult {
            self.log.lock().unwrap().push(format!("{}:close", self.name));
            Ok(())
        }
    }

    struct SystemRecorder(Log);

    impl SystemListener for SystemRecorder {
        fn on_cycle_start(&mut self, window: &CycleWindow) -> ListenerResult {
            self.0.lock().unwrap().push(format!("start{}", window.time_code_start));
            Ok(())
        }

        fn on_cycle_end(&mut self, window: &CycleWindow) -> ListenerResult {
            self.0.lock().unwrap().push(format!("end{}", window.time_code_start));
            Ok(())
        }

        fn on_connection_changed(&mut self) -> ListenerResult {
            self.0.lock().unwrap().push("connections".to_string());
            Ok(())
        }
    }

    fn active(name: &str, listener: PortListener) -> ActivePort {
        let state = Arc::new(PortState::new(
            next_port_id(),
            name,
            listener.direction(),
            PortInfo::default(),
        ));
        ActivePort::new(state, listener, 8)
    }

    fn window(start: u64) -> CycleWindow {
        CycleWindow {
            time_code_start: start,
            time_code_duration: 64,
            is_last_cycle: false,
        }
    }

    fn engine() -> (ProcessCycleEngine, EngineHandle) {
        channel(Arc::new(CycleControl::new()), 16)
    }

    fn push(handle: &mut EngineHandle, port: ActivePort) {
        assert!(handle.commands.push(Command::AddPort(port)).is_ok());
    }

    #[test]
    fn ports_join_at_the_next_cycle() {
        let (mut engine, mut handle) = engine();
        let log = Log::default();
        push(
            &mut handle,
            active(
                "in",
                PortListener::Input(Box::new(Recorder {
                    name: "in",
                    log: log.clone(),
                    fail_at: None,
                })),
            ),
        );
        assert_eq!(engine.input_count(), 0);
        engine.process(window(0), &mut FakeIo::default());
        assert_eq!(engine.input_count(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["in:in0"]);
    }

    #[test]
    fn inputs_run_before_outputs_between_cycle_callbacks() {
        let (mut engine, mut handle) = engine();
        let log = Log::default();
        engine.set_listener(Box::new(SystemRecorder(log.clone())));
        push(
            &mut handle,
            active(
                "out",
                PortListener::Output(Box::new(Sender {
                    name: "out",
                    log: log.clone(),
                    tick: 0,
                })),
            ),
        );
        let input = active(
            "in",
            PortListener::Input(Box::new(Recorder {
                name: "in",
                log: log.clone(),
                fail_at: None,
            })),
        );
        let input_id = input.id();
        push(&mut handle, input);

        let mut io = FakeIo::default();
        io.inputs.insert(input_id, vec![(3, vec![0x90, 1, 2])]);
        engine.process(window(0), &mut io);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start0", "in:in1", "out:out", "end0"]
        );
        assert_eq!(io.written.len(), 1);
    }

    #[test]
    fn failing_port_closes_without_stopping_siblings() {
        let (mut engine, mut handle) = engine();
        let log = Log::default();
        let bad = active(
            "bad",
            PortListener::Output(Box::new(Sender {
                name: "bad",
                log: log.clone(),
                tick: 64,
            })),
        );
        let bad_state = bad.state().clone();
        push(&mut handle, bad);
        push(
            &mut handle,
            active(
                "good",
                PortListener::Output(Box::new(Sender {
                    name: "good",
                    log: log.clone(),
                    tick: 63,
                })),
            ),
        );

        let mut io = FakeIo::default();
        engine.process(window(0), &mut io);
        engine.process(window(64), &mut io);

        assert!(bad_state.is_closed());
        assert_eq!(engine.output_count(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["bad:out", "bad:close", "good:out", "good:out"]
        );
        assert_eq!(io.written.len(), 2);
        let failure = bad_state.take_failure().unwrap();
        assert_eq!(failure.port_name(), Some("bad"));
        assert!(matches!(
            failure.cause,
            FailureCause::Codec(CodecError::TickOutOfRange { tick: 64, .. })
        ));
    }

    #[test]
    fn close_command_hands_the_listener_back() {
        let (mut engine, mut handle) = engine();
        let log = Log::default();
        let port = active(
            "in",
            PortListener::Input(Box::new(Recorder {
                name: "in",
                log: log.clone(),
                fail_at: Some(0),
            })),
        );
        let id = port.id();
        push(&mut handle, port);
        engine.handle_command_queue();

        assert!(handle.commands.push(Command::ClosePort(id)).is_ok());
        engine.process(window(0), &mut FakeIo::default());
        let retired = handle.retired.pop().unwrap();
        assert_eq!(retired.id, id);
        assert!(retired.port.is_some());
        assert!(log.lock().unwrap().is_empty());

        assert!(handle.commands.push(Command::ClosePort(id)).is_ok());
        engine.handle_command_queue();
        assert!(handle.retired.pop().unwrap().port.is_none());
    }

    #[test]
    fn counts_missed_cycles() {
        let (mut engine, _handle) = engine();
        let mut io = FakeIo::default();
        engine.process(window(0), &mut io);
        engine.process(window(64), &mut io);
        engine.process(window(256), &mut io);
        let stats = engine.control().stats();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.missed_cycles, 2);
    }

    #[test]
    fn last_cycle_closes_live_ports() {
        let (mut engine, mut handle) = engine();
        let log = Log::default();
        push(
            &mut handle,
            active(
                "in",
                PortListener::Input(Box::new(Recorder {
                    name: "in",
                    log: log.clone(),
                    fail_at: None,
                })),
            ),
        );
        let mut last = window(0);
        last.is_last_cycle = true;
        engine.process(last, &mut FakeIo::default());
        assert_eq!(engine.input_count(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["in:in0", "in:close"]);
    }

    #[test]
    fn failing_system_listener_is_detached() {
        struct Broken(Arc<AtomicU64>);
        impl SystemListener for Broken {
            fn on_cycle_start(&mut self, _window: &CycleWindow) -> ListenerResult {
                self.0.fetch_add(1, Ordering::SeqCst);
                panic!("broken listener");
            }
        }

        let (mut engine, _handle) = engine();
        let calls = Arc::new(AtomicU64::new(0));
        engine.set_listener(Box::new(Broken(calls.clone())));
        engine.control().notify_connection_changed();
        let mut io = FakeIo::default();
        engine.process(window(0), &mut io);
        engine.process(window(64), &mut io);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failures = engine.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].origin, FailureOrigin::System(Callback::CycleStart));
    }

    #[test]
    fn connection_changes_are_reported_once() {
        let (mut engine, _handle) = engine();
        let log = Log::default();
        engine.set_listener(Box::new(SystemRecorder(log.clone())));
        engine.control().notify_connection_changed();
        let mut io = FakeIo::default();
        engine.process(window(0), &mut io);
        engine.process(window(64), &mut io);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["connections", "start0", "end0", "start64", "end64"]
        );
    }
}
