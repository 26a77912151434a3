//! A transport without a server. Cycles are paced by sleeping, inputs
//! receive whatever was injected through a [`DummyHandle`], and with
//! loopback enabled every output event reappears on all inputs one cycle
//! later.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::info;
use midicycle_core::buffer::RawEventBuffer;
use midicycle_core::codec::CodecError;
use midicycle_core::engine::ProcessCycleEngine;
use midicycle_core::transport::{CycleDriver, CycleIo, DriverExit, Transport, TransportError};
use midicycle_core::{Architecture, CycleWindow, Direction, PortId, PortInfo};

#[derive(Clone, Debug)]
pub struct DummyConfig {
    pub cycle_frames: u32,
    pub period: Duration,
    pub loopback: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        DummyConfig {
            cycle_frames: 1024,
            period: Duration::from_millis(20),
            loopback: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentEvent {
    pub port: PortId,
    pub time_code: u64,
    pub frame: u32,
    pub data: Vec<u8>,
}

struct Injection {
    port: Option<PortId>,
    raw: Vec<u8>,
    delta_times: Vec<u32>,
}

#[derive(Default)]
struct Shared {
    injections: Vec<Injection>,
    skip_frames: u64,
    connection_changed: bool,
    sent: Vec<SentEvent>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feeds and inspects a running [`DummyTransport`] from another thread.
#[derive(Clone)]
pub struct DummyHandle {
    shared: Arc<Mutex<Shared>>,
}

impl DummyHandle {
    /// Delivers events in the wire layout to `port` during the next cycle.
    pub fn inject(&self, port: PortId, raw: Vec<u8>, delta_times: Vec<u32>) {
        lock(&self.shared).injections.push(Injection {
            port: Some(port),
            raw,
            delta_times,
        });
    }

    /// Delivers events to every input during the next cycle.
    pub fn inject_all(&self, raw: Vec<u8>, delta_times: Vec<u32>) {
        lock(&self.shared).injections.push(Injection {
            port: None,
            raw,
            delta_times,
        });
    }

    /// Advances the clock as if `frames` had passed without a cycle.
    pub fn skip_frames(&self, frames: u64) {
        lock(&self.shared).skip_frames += frames;
    }

    pub fn notify_connection_changed(&self) {
        lock(&self.shared).connection_changed = true;
    }

    pub fn sent_events(&self) -> Vec<SentEvent> {
        lock(&self.shared).sent.clone()
    }
}

pub struct DummyTransport {
    config: DummyConfig,
    shared: Arc<Mutex<Shared>>,
    client_name: Option<String>,
    ports: Vec<(PortId, String, Direction)>,
}

impl DummyTransport {
    pub fn new(config: DummyConfig) -> DummyTransport {
        DummyTransport {
            config,
            shared: Arc::default(),
            client_name: None,
            ports: Vec::new(),
        }
    }

    pub fn handle(&self) -> DummyHandle {
        DummyHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Default for DummyTransport {
    fn default() -> Self {
        DummyTransport::new(DummyConfig::default())
    }
}

impl Transport for DummyTransport {
    fn architecture(&self) -> Option<Architecture> {
        None
    }

    fn is_available(&self) -> bool {
        true
    }

    fn open(&mut self, client_name: &str) -> Result<(), TransportError> {
        if self.client_name.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        info!("Started dummy client {}.", client_name);
        self.client_name = Some(client_name.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.client_name.take().ok_or(TransportError::NotConnected)?;
        self.ports.clear();
        Ok(())
    }

    fn describe_port(&self, name: &str, direction: Direction) -> PortInfo {
        PortInfo {
            name: Some(name.to_string()),
            input: direction.is_input(),
            vendor: Some("midicycle".to_string()),
            description: Some(
                match direction {
                    Direction::Input => "dummy midi in",
                    Direction::Output => "dummy midi out",
                }
                .to_string(),
            ),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            index: -1,
            architecture: None,
        }
    }

    fn register_port(
        &mut self,
        id: PortId,
        name: &str,
        direction: Direction,
    ) -> Result<(), TransportError> {
        if self.client_name.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.ports.push((id, name.to_string(), direction));
        Ok(())
    }

    fn unregister_port(&mut self, id: PortId) -> Result<(), TransportError> {
        let idx = self
            .ports
            .iter()
            .position(|(port, _, _)| *port == id)
            .ok_or(TransportError::UnknownPort(id))?;
        self.ports.remove(idx);
        Ok(())
    }

    /// With loopback the sources of the inputs are this client's outputs
    /// and the other way round.
    fn server_ports(&self, direction: Direction) -> Result<Vec<PortInfo>, TransportError> {
        if self.client_name.is_none() {
            return Err(TransportError::NotConnected);
        }
        Ok(self
            .ports
            .iter()
            .filter(|(_, _, d)| *d != direction)
            .enumerate()
            .map(|(index, (_, name, _))| PortInfo {
                index: index as i32,
                ..self.describe_port(name, direction)
            })
            .collect())
    }

    fn driver(&mut self) -> Result<Box<dyn CycleDriver>, TransportError> {
        if self.client_name.is_none() {
            return Err(TransportError::NotConnected);
        }
        Ok(Box::new(DummyDriver {
            config: self.config.clone(),
            shared: self.shared.clone(),
            frame: 0,
        }))
    }
}

struct DummyDriver {
    config: DummyConfig,
    shared: Arc<Mutex<Shared>>,
    frame: u64,
}

impl CycleDriver for DummyDriver {
    fn run(mut self: Box<Self>, mut engine: ProcessCycleEngine) -> DriverExit {
        info!(
            "Running dummy cycles of {} frames every {:?}.",
            self.config.cycle_frames, self.config.period
        );
        let duration = u64::from(self.config.cycle_frames);
        let mut loopback = Vec::new();
        loop {
            // Add a delay to decrease the CPU usage.
            std::thread::sleep(self.config.period);
            let is_last_cycle = engine.control().stop_requested();
            let injections = {
                let mut shared = lock(&self.shared);
                self.frame += std::mem::take(&mut shared.skip_frames);
                if std::mem::take(&mut shared.connection_changed) {
                    engine.control().notify_connection_changed();
                }
                std::mem::take(&mut shared.injections)
            };
            let window = CycleWindow {
                time_code_start: self.frame,
                time_code_duration: duration,
                is_last_cycle,
            };
            let mut io = DummyIo {
                time_code: self.frame,
                injections,
                loopback: std::mem::take(&mut loopback),
                sent: Vec::new(),
            };
            engine.process(window, &mut io);
            self.frame += duration;

            if self.config.loopback {
                loopback = io.sent.iter().map(|e| (e.frame, e.data.clone())).collect();
            }
            lock(&self.shared).sent.extend(io.sent);
            if is_last_cycle {
                return DriverExit::finished(engine);
            }
        }
    }
}

struct DummyIo {
    time_code: u64,
    injections: Vec<Injection>,
    loopback: Vec<(u32, Vec<u8>)>,
    sent: Vec<SentEvent>,
}

impl CycleIo for DummyIo {
    fn read_input(&mut self, port: PortId, buffer: &mut RawEventBuffer) -> Result<(), CodecError> {
        buffer.clear();
        for (frame, data) in self.loopback.iter() {
            buffer.push(*frame, data)?;
        }
        for injection in self
            .injections
            .iter()
            .filter(|i| i.port.map_or(true, |p| p == port))
        {
            buffer.extend_from_wire(&injection.raw, &injection.delta_times)?;
        }
        Ok(())
    }

    fn write_output(&mut self, port: PortId, buffer: &RawEventBuffer) -> Result<(), TransportError> {
        for event in buffer.iter() {
            self.sent.push(SentEvent {
                port,
                time_code: self.time_code,
                frame: event.frame,
                data: event.data.to_vec(),
            });
        }
        Ok(())
    }
}
