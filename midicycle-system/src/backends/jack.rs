use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use jack::PortSpec;
use log::{debug, info, warn};
use midicycle_core::buffer::RawEventBuffer;
use midicycle_core::codec::CodecError;
use midicycle_core::engine::{CycleControl, ProcessCycleEngine};
use midicycle_core::transport::{CycleDriver, CycleIo, DriverExit, Transport, TransportError};
use midicycle_core::{Architecture, CycleWindow, Direction, PortId, PortInfo};
use ringbuf::{Consumer, Producer, RingBuffer};

const COMMAND_QUEUE_SIZE: usize = 1024;
const LAST_CYCLE_TIMEOUT: Duration = Duration::from_secs(5);
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);

enum NativePort {
    Input(jack::Port<jack::MidiIn>),
    Output(jack::Port<jack::MidiOut>),
}

impl NativePort {
    fn unregister(self, client: &jack::Client) {
        let result = match self {
            NativePort::Input(port) => client.unregister_port(port),
            NativePort::Output(port) => client.unregister_port(port),
        };
        if let Err(e) = result {
            warn!("Could not unregister jack port: {}", e);
        }
    }
}

enum JackCommand {
    Add(PortId, NativePort),
    Remove(PortId),
}

#[derive(Default)]
struct PortSet {
    inputs: Vec<(PortId, jack::Port<jack::MidiIn>)>,
    outputs: Vec<(PortId, jack::Port<jack::MidiOut>)>,
}

impl PortSet {
    fn with_capacity(capacity: usize) -> PortSet {
        PortSet {
            inputs: Vec::with_capacity(capacity),
            outputs: Vec::with_capacity(capacity),
        }
    }

    fn insert(&mut self, id: PortId, port: NativePort) {
        match port {
            NativePort::Input(port) => self.inputs.push((id, port)),
            NativePort::Output(port) => self.outputs.push((id, port)),
        }
    }

    fn remove(&mut self, id: PortId) -> Option<NativePort> {
        if let Some(idx) = self.inputs.iter().position(|(port, _)| *port == id) {
            return Some(NativePort::Input(self.inputs.remove(idx).1));
        }
        let idx = self.outputs.iter().position(|(port, _)| *port == id)?;
        Some(NativePort::Output(self.outputs.remove(idx).1))
    }

    fn unregister_all(&mut self, client: &jack::Client) {
        for (_, port) in self.inputs.drain(..) {
            NativePort::Input(port).unregister(client);
        }
        for (_, port) in self.outputs.drain(..) {
            NativePort::Output(port).unregister(client);
        }
    }
}

enum ClientSlot {
    Closed,
    Idle(jack::Client),
    Active(jack::AsyncClient<Notifications, Processor>),
    /// A failed activation consumed the client.
    Lost,
}

impl ClientSlot {
    fn client(&self) -> Option<&jack::Client> {
        match self {
            ClientSlot::Closed | ClientSlot::Lost => None,
            ClientSlot::Idle(client) => Some(client),
            ClientSlot::Active(client) => Some(client.as_client()),
        }
    }
}

struct JackState {
    slot: ClientSlot,
    /// Ports owned by the control side while the client is not active.
    ports: PortSet,
    commands: Option<Producer<JackCommand>>,
    retired: Option<Consumer<(PortId, Option<NativePort>)>>,
}

fn lock(state: &Mutex<JackState>) -> MutexGuard<'_, JackState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands the engine to the process callback. The callback takes it on its
/// first cycle without blocking; whatever is still here when the client
/// stops goes back to the session.
#[derive(Clone)]
struct EngineSlot(Arc<Mutex<Option<ProcessCycleEngine>>>);

impl EngineSlot {
    fn new(engine: ProcessCycleEngine) -> EngineSlot {
        EngineSlot(Arc::new(Mutex::new(Some(engine))))
    }

    fn try_take(&self) -> Option<ProcessCycleEngine> {
        self.0.try_lock().ok().and_then(|mut engine| engine.take())
    }

    fn take(&self) -> Option<ProcessCycleEngine> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

fn native(e: jack::Error) -> TransportError {
    TransportError::Native(e.to_string())
}

/// A client of a running JACK server. The server is never started on demand.
pub struct JackTransport {
    state: Arc<Mutex<JackState>>,
}

impl JackTransport {
    pub fn new() -> JackTransport {
        JackTransport {
            state: Arc::new(Mutex::new(JackState {
                slot: ClientSlot::Closed,
                ports: PortSet::default(),
                commands: None,
                retired: None,
            })),
        }
    }
}

impl Default for JackTransport {
    fn default() -> Self {
        JackTransport::new()
    }
}

impl Transport for JackTransport {
    fn architecture(&self) -> Option<Architecture> {
        Some(Architecture::Jack)
    }

    fn is_available(&self) -> bool {
        true
    }

    fn open(&mut self, client_name: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !matches!(state.slot, ClientSlot::Closed) {
            return Err(TransportError::AlreadyConnected);
        }
        let (client, status) =
            jack::Client::new(client_name, jack::ClientOptions::NO_START_SERVER).map_err(native)?;
        info!("Started client {} with status {:?}.", client.name(), status);
        state.slot = ClientSlot::Idle(client);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let client = match std::mem::replace(&mut state.slot, ClientSlot::Closed) {
            ClientSlot::Closed => return Err(TransportError::NotConnected),
            ClientSlot::Lost => {
                state.ports = PortSet::default();
                info!("Closed a client that failed to activate.");
                return Ok(());
            }
            ClientSlot::Idle(client) => client,
            ClientSlot::Active(active) => {
                warn!("Closing an active jack client.");
                state.commands = None;
                state.retired = None;
                let (client, _, _) = active.deactivate().map_err(native)?;
                client
            }
        };
        state.ports.unregister_all(&client);
        info!("Closed client {}.", client.name());
        Ok(())
    }

    fn describe_port(&self, name: &str, direction: Direction) -> PortInfo {
        PortInfo {
            name: Some(name.to_string()),
            input: direction.is_input(),
            vendor: Some("Jack Audio".to_string()),
            description: Some(
                match direction {
                    Direction::Input => "MIDI_In",
                    Direction::Output => "MIDI_Out",
                }
                .to_string(),
            ),
            version: Some("0.0".to_string()),
            index: -1,
            architecture: Some(Architecture::Jack),
        }
    }

    fn register_port(
        &mut self,
        id: PortId,
        name: &str,
        direction: Direction,
    ) -> Result<(), TransportError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let client = state.slot.client().ok_or(TransportError::NotConnected)?;
        let port = match direction {
            Direction::Input => NativePort::Input(
                client
                    .register_port(name, jack::MidiIn::default())
                    .map_err(native)?,
            ),
            Direction::Output => NativePort::Output(
                client
                    .register_port(name, jack::MidiOut::default())
                    .map_err(native)?,
            ),
        };
        match state.commands.as_mut() {
            None => state.ports.insert(id, port),
            Some(commands) => {
                if let Err(JackCommand::Add(_, port)) = commands.push(JackCommand::Add(id, port)) {
                    port.unregister(client);
                    return Err(TransportError::Native(
                        "jack command queue is full".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn unregister_port(&mut self, id: PortId) -> Result<(), TransportError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let client = state.slot.client().ok_or(TransportError::NotConnected)?;
        let (commands, retired) = match (state.commands.as_mut(), state.retired.as_mut()) {
            (Some(commands), Some(retired)) => (commands, retired),
            _ => {
                let port = state.ports.remove(id).ok_or(TransportError::UnknownPort(id))?;
                port.unregister(client);
                return Ok(());
            }
        };
        if commands.push(JackCommand::Remove(id)).is_err() {
            return Err(TransportError::Native(
                "jack command queue is full".to_string(),
            ));
        }
        let deadline = Instant::now() + RETIRE_TIMEOUT;
        loop {
            let mut found = None;
            retired.pop_each(
                |(retired_id, port)| {
                    if retired_id == id {
                        found = Some(port);
                    } else if let Some(port) = port {
                        port.unregister(client);
                    }
                    true
                },
                None,
            );
            match found {
                Some(Some(port)) => {
                    port.unregister(client);
                    return Ok(());
                }
                Some(None) => return Err(TransportError::UnknownPort(id)),
                None if Instant::now() >= deadline => {
                    return Err(TransportError::Timeout("jack process callback", RETIRE_TIMEOUT))
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn server_ports(&self, direction: Direction) -> Result<Vec<PortInfo>, TransportError> {
        let state = lock(&self.state);
        let client = state.slot.client().ok_or(TransportError::NotConnected)?;
        // Our inputs read from the server's outputs and the other way round.
        let flags = match direction {
            Direction::Input => jack::PortFlags::IS_OUTPUT,
            Direction::Output => jack::PortFlags::IS_INPUT,
        };
        let spec = jack::MidiIn::default();
        Ok(client
            .ports(None, Some(spec.jack_port_type()), flags)
            .iter()
            .enumerate()
            .map(|(index, name)| PortInfo {
                index: index as i32,
                ..self.describe_port(name, direction)
            })
            .collect())
    }

    fn driver(&mut self) -> Result<Box<dyn CycleDriver>, TransportError> {
        let state = lock(&self.state);
        match state.slot {
            ClientSlot::Idle(_) => Ok(Box::new(JackDriver {
                state: self.state.clone(),
            })),
            ClientSlot::Active(_) => Err(TransportError::AlreadyConnected),
            ClientSlot::Closed | ClientSlot::Lost => Err(TransportError::NotConnected),
        }
    }
}

/// Activates the client and supervises it until the last cycle ran on the
/// JACK real-time thread.
struct JackDriver {
    state: Arc<Mutex<JackState>>,
}

impl CycleDriver for JackDriver {
    fn run(self: Box<Self>, engine: ProcessCycleEngine) -> DriverExit {
        let control = engine.control().clone();
        let finished = Arc::new(AtomicBool::new(false));
        let engine_slot = EngineSlot::new(engine);
        {
            let mut state = lock(&self.state);
            let client = match std::mem::replace(&mut state.slot, ClientSlot::Closed) {
                ClientSlot::Idle(client) => client,
                other => {
                    state.slot = other;
                    return DriverExit::failed(engine_slot.take(), TransportError::NotConnected);
                }
            };
            let (command_tx, command_rx) = RingBuffer::<JackCommand>::new(COMMAND_QUEUE_SIZE).split();
            let (retired_tx, retired_rx) = RingBuffer::new(COMMAND_QUEUE_SIZE).split();
            let mut ports = PortSet::with_capacity(128);
            let idle_ports = std::mem::take(&mut state.ports);
            ports.inputs.extend(idle_ports.inputs);
            ports.outputs.extend(idle_ports.outputs);
            let processor = Processor {
                engine: None,
                engine_slot: engine_slot.clone(),
                ports,
                commands: command_rx,
                retired: retired_tx,
                clock: FrameClock::default(),
                control: control.clone(),
                finished: finished.clone(),
            };
            let notifications = Notifications {
                control: control.clone(),
            };
            match client.activate_async(notifications, processor) {
                Ok(active) => {
                    state.slot = ClientSlot::Active(active);
                    state.commands = Some(command_tx);
                    state.retired = Some(retired_rx);
                }
                Err(e) => {
                    // The client and its ports went down with the failed
                    // activation, the engine did not.
                    state.slot = ClientSlot::Lost;
                    return DriverExit::failed(engine_slot.take(), native(e));
                }
            }
        }

        control.wait_for_stop();
        let deadline = Instant::now() + LAST_CYCLE_TIMEOUT;
        while !finished.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut state = lock(&self.state);
        let active = match std::mem::replace(&mut state.slot, ClientSlot::Closed) {
            ClientSlot::Active(active) => active,
            other => {
                state.slot = other;
                return DriverExit::failed(engine_slot.take(), TransportError::NotConnected);
            }
        };
        state.commands = None;
        let retired = state.retired.take();
        let (client, _, mut processor) = match active.deactivate() {
            Ok(parts) => parts,
            Err(e) => {
                state.slot = ClientSlot::Lost;
                return DriverExit::failed(engine_slot.take(), native(e));
            }
        };
        processor.handle_command_queue();
        if let Some(mut retired) = retired {
            retired.pop_each(
                |(_, port)| {
                    if let Some(port) = port {
                        port.unregister(&client);
                    }
                    true
                },
                None,
            );
        }
        state.ports = std::mem::take(&mut processor.ports);
        state.slot = ClientSlot::Idle(client);

        let engine = match processor.engine.take().or_else(|| engine_slot.take()) {
            Some(engine) => engine,
            None => return DriverExit::failed(None, TransportError::NotConnected),
        };
        if finished.load(Ordering::Acquire) {
            DriverExit::finished(engine)
        } else {
            warn!("The last jack cycle did not run, deactivated the client anyway.");
            DriverExit::failed(
                Some(engine),
                TransportError::Timeout("jack process callback", LAST_CYCLE_TIMEOUT),
            )
        }
    }
}

/// Widens JACK's wrapping 32 bit frame time.
#[derive(Default)]
struct FrameClock {
    last: Option<u32>,
    epoch: u64,
}

impl FrameClock {
    fn extend(&mut self, frame: u32) -> u64 {
        if let Some(last) = self.last {
            if frame < last {
                self.epoch += 1 << 32;
            }
        }
        self.last = Some(frame);
        self.epoch + u64::from(frame)
    }
}

struct Notifications {
    control: Arc<CycleControl>,
}

impl jack::NotificationHandler for Notifications {
    fn ports_connected(
        &mut self,
        _: &jack::Client,
        _port_id_a: jack::PortId,
        _port_id_b: jack::PortId,
        _are_connected: bool,
    ) {
        self.control.notify_connection_changed();
    }
}

struct Processor {
    engine: Option<ProcessCycleEngine>,
    engine_slot: EngineSlot,
    ports: PortSet,
    commands: Consumer<JackCommand>,
    retired: Producer<(PortId, Option<NativePort>)>,
    clock: FrameClock,
    control: Arc<CycleControl>,
    finished: Arc<AtomicBool>,
}

impl Processor {
    fn handle_command_queue(&mut self) {
        let ports = &mut self.ports;
        let retired = &mut self.retired;
        self.commands.pop_each(
            |command| {
                match command {
                    JackCommand::Add(id, port) => ports.insert(id, port),
                    JackCommand::Remove(id) => {
                        if retired.push((id, ports.remove(id))).is_err() {
                            warn!("Retired port queue is full, dropping port {}.", id);
                        }
                    }
                }
                true
            },
            None,
        );
    }
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        if self.finished.load(Ordering::Acquire) {
            return jack::Control::Continue;
        }
        if self.engine.is_none() {
            self.engine = self.engine_slot.try_take();
        }
        self.handle_command_queue();
        for (_, port) in self.ports.outputs.iter_mut() {
            port.writer(ps);
        }
        let engine = match self.engine.as_mut() {
            Some(engine) => engine,
            None => return jack::Control::Continue,
        };
        let is_last_cycle = self.control.stop_requested();
        let window = CycleWindow {
            time_code_start: self.clock.extend(ps.last_frame_time()),
            time_code_duration: u64::from(ps.n_frames()),
            is_last_cycle,
        };
        let mut io = JackIo {
            ps,
            inputs: &self.ports.inputs,
            outputs: &mut self.ports.outputs,
        };
        engine.process(window, &mut io);
        if is_last_cycle {
            self.finished.store(true, Ordering::Release);
        }
        jack::Control::Continue
    }
}

struct JackIo<'a> {
    ps: &'a jack::ProcessScope,
    inputs: &'a [(PortId, jack::Port<jack::MidiIn>)],
    outputs: &'a mut [(PortId, jack::Port<jack::MidiOut>)],
}

impl CycleIo for JackIo<'_> {
    fn read_input(&mut self, port: PortId, buffer: &mut RawEventBuffer) -> Result<(), CodecError> {
        buffer.clear();
        let midi_in = match self.inputs.iter().find(|(id, _)| *id == port) {
            Some((_, midi_in)) => midi_in,
            None => return Ok(()),
        };
        for event in midi_in.iter(self.ps) {
            if event.bytes.len() > 3 {
                debug!("Skipping {} byte system exclusive message.", event.bytes.len());
                continue;
            }
            buffer.push(event.time, event.bytes)?;
        }
        Ok(())
    }

    fn write_output(&mut self, port: PortId, buffer: &RawEventBuffer) -> Result<(), TransportError> {
        let (_, midi_out) = self
            .outputs
            .iter_mut()
            .find(|(id, _)| *id == port)
            .ok_or(TransportError::UnknownPort(port))?;
        let mut writer = midi_out.writer(self.ps);
        for event in buffer.iter() {
            writer
                .write(&jack::RawMidi {
                    time: event.frame,
                    bytes: event.data,
                })
                .map_err(native)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_clock_survives_wrap_around() {
        let mut clock = FrameClock::default();
        assert_eq!(clock.extend(u32::MAX - 255), u64::from(u32::MAX - 255));
        assert_eq!(clock.extend(768), (1u64 << 32) + 768);
        assert_eq!(clock.extend(1792), (1u64 << 32) + 1792);
    }

    #[test]
    fn ports_are_described_as_jack_ports() {
        let transport = JackTransport::new();
        let info = transport.describe_port("in", Direction::Input);
        assert_eq!(info.vendor.as_deref(), Some("Jack Audio"));
        assert_eq!(info.description.as_deref(), Some("MIDI_In"));
        assert_eq!(info.architecture, Some(Architecture::Jack));
        assert_eq!(
            transport.describe_port("out", Direction::Output).description.as_deref(),
            Some("MIDI_Out")
        );
    }

    fn idle_processor(engine_slot: EngineSlot) -> Processor {
        let (_, commands) = RingBuffer::<JackCommand>::new(4).split();
        let (retired, _) = RingBuffer::new(4).split();
        let control = Arc::new(CycleControl::new());
        Processor {
            engine: None,
            engine_slot,
            ports: PortSet::default(),
            commands,
            retired,
            clock: FrameClock::default(),
            control,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn engine_survives_a_processor_that_never_ran() {
        let control = Arc::new(CycleControl::new());
        let (engine, _handle) = midicycle_core::engine::channel(control, 8);
        let engine_slot = EngineSlot::new(engine);
        drop(idle_processor(engine_slot.clone()));
        assert!(engine_slot.take().is_some());
        assert!(engine_slot.take().is_none());
    }

    #[test]
    fn processor_takes_the_engine_once() {
        let control = Arc::new(CycleControl::new());
        let (engine, _handle) = midicycle_core::engine::channel(control, 8);
        let engine_slot = EngineSlot::new(engine);
        let mut processor = idle_processor(engine_slot.clone());
        processor.engine = processor.engine_slot.try_take();
        assert!(processor.engine.is_some());
        assert!(engine_slot.take().is_none());
    }

    #[test]
    fn client_lost_to_activation_can_still_be_closed() {
        let mut transport = JackTransport::new();
        lock(&transport.state).slot = ClientSlot::Lost;
        assert!(matches!(
            transport.register_port(1, "in", Direction::Input),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(transport.driver(), Err(TransportError::NotConnected)));
        transport.close().unwrap();
        assert!(matches!(transport.close(), Err(TransportError::NotConnected)));
    }

    #[test]
    fn closed_transport_has_no_ports() {
        let mut transport = JackTransport::new();
        assert!(matches!(
            transport.server_ports(Direction::Input),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(transport.close(), Err(TransportError::NotConnected)));
        assert!(transport.driver().is_err());
    }
}
