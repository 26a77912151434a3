//! Process-cycle engine for exchanging MIDI with a real-time audio server.
//!
//! A [`MidiSystem`] owns a set of named ports. Once started, a dedicated
//! cycle thread runs the [`engine::ProcessCycleEngine`] once per server
//! cycle, handing decoded events to input listeners and collecting events
//! from output listeners. Listener failures are contained per port and
//! reported when the system is closed.

pub mod buffer;
pub mod codec;
pub mod command;
pub mod engine;
pub mod error;
pub mod info;
pub mod listener;
pub mod port;
pub mod registry;
pub mod session;
pub mod transport;

pub use codec::{ShortMessage, TimedEvent};
pub use error::{Error, ExecutionFailure, Failure, FailureCause, FailureOrigin, Result};
pub use info::{Architecture, PortInfo};
pub use listener::{InputPortListener, ListenerError, OutputPortListener, SystemListener};
pub use port::MidiPort;
pub use session::{MidiSystem, SystemConfig, ThreadFactory};

pub type PortId = u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawMidi<'a> {
    pub frame: u32,
    pub data: &'a [u8],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn is_input(self) -> bool {
        self == Direction::Input
    }
}

/// The time span covered by one process cycle, in ticks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CycleWindow {
    pub time_code_start: u64,
    pub time_code_duration: u64,
    pub is_last_cycle: bool,
}
