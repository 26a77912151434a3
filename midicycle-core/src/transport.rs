//! The boundary between the engine and a native audio/MIDI server.

use std::time::Duration;

use thiserror::Error;

use crate::buffer::RawEventBuffer;
use crate::codec::CodecError;
use crate::engine::ProcessCycleEngine;
use crate::info::{Architecture, PortInfo};
use crate::{Direction, PortId};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to the server")]
    NotConnected,
    #[error("already connected to the server")]
    AlreadyConnected,
    #[error("port {0} is not registered")]
    UnknownPort(PortId),
    #[error("{0} did not respond within {1:?}")]
    Timeout(&'static str, Duration),
    #[error("{0}")]
    Native(String),
}

/// Per-cycle access to the native port buffers.
pub trait CycleIo {
    /// Replaces the content of `buffer` with the events received on `port`
    /// during the current cycle.
    fn read_input(&mut self, port: PortId, buffer: &mut RawEventBuffer) -> Result<(), CodecError>;

    /// Hands the events encoded for `port` to the server.
    fn write_output(&mut self, port: PortId, buffer: &RawEventBuffer) -> Result<(), TransportError>;
}

/// A connection to a native server, driven by the session.
///
/// Ports are registered by the id the session assigned; a transport never
/// invents ids of its own.
pub trait Transport: Send {
    fn architecture(&self) -> Option<Architecture>;

    fn is_available(&self) -> bool;

    fn open(&mut self, client_name: &str) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Metadata for a port of this transport, fixed when the port is created.
    fn describe_port(&self, name: &str, direction: Direction) -> PortInfo;

    fn register_port(
        &mut self,
        id: PortId,
        name: &str,
        direction: Direction,
    ) -> Result<(), TransportError>;

    fn unregister_port(&mut self, id: PortId) -> Result<(), TransportError>;

    /// Ports visible on the server that data of `direction` can be
    /// exchanged with: sources for inputs, sinks for outputs.
    fn server_ports(&self, direction: Direction) -> Result<Vec<PortInfo>, TransportError>;

    /// Prepares the blocking run loop executed on the cycle thread.
    fn driver(&mut self) -> Result<Box<dyn CycleDriver>, TransportError>;
}

pub trait CycleDriver: Send {
    /// Runs cycles until the engine's control requests a stop, then runs one
    /// more cycle flagged as the last one and hands the engine back.
    fn run(self: Box<Self>, engine: ProcessCycleEngine) -> DriverExit;
}

#[derive(Debug)]
pub struct DriverExit {
    pub engine: Option<ProcessCycleEngine>,
    pub result: Result<(), TransportError>,
}

impl DriverExit {
    pub fn finished(engine: ProcessCycleEngine) -> DriverExit {
        DriverExit {
            engine: Some(engine),
            result: Ok(()),
        }
    }

    pub fn failed(engine: Option<ProcessCycleEngine>, error: TransportError) -> DriverExit {
        DriverExit {
            engine,
            result: Err(error),
        }
    }
}
