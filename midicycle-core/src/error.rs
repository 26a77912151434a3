use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::info::Architecture;
use crate::listener::ListenerError;
use crate::transport::TransportError;
use crate::PortId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("architecture {0} is not available")]
    Unavailable(Architecture),

    #[error("could not create port \"{name}\"")]
    Creation {
        name: String,
        #[source]
        source: FailureCause,
    },

    #[error("port {0} is already closed")]
    PortClosed(PortId),

    #[error("the process thread did not respond within {0:?}")]
    Unresponsive(Duration),

    #[error("could not spawn the process thread")]
    Spawn(#[source] std::io::Error),

    #[error("the command queue is full")]
    CommandQueueFull,

    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("attempt to open the midi system twice")]
    AlreadyOpen,
    #[error("the midi system is not open")]
    NotOpen,
    #[error("cannot run, the midi system is not runnable")]
    NotRunnable,
}

/// Why a callback or the cycle thread failed.
#[derive(Debug, Error)]
pub enum FailureCause {
    #[error("{0}")]
    Listener(#[source] ListenerError),
    #[error("panicked: {0}")]
    Panic(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("the command queue is full")]
    CommandQueueFull,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Callback {
    Open,
    Process,
    Close,
    CycleStart,
    CycleEnd,
    ConnectionChanged,
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Callback::Open => "on_open",
            Callback::Process => "process",
            Callback::Close => "on_close",
            Callback::CycleStart => "on_cycle_start",
            Callback::CycleEnd => "on_cycle_end",
            Callback::ConnectionChanged => "on_connection_changed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOrigin {
    Port {
        id: PortId,
        name: String,
        callback: Callback,
    },
    System(Callback),
    CycleThread,
    Transport,
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureOrigin::Port { name, callback, .. } => {
                write!(f, "port \"{}\" failed in {}", name, callback)
            }
            FailureOrigin::System(callback) => write!(f, "system listener failed in {}", callback),
            FailureOrigin::CycleThread => f.write_str("process thread failed"),
            FailureOrigin::Transport => f.write_str("transport failed"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{origin}: {cause}")]
pub struct Failure {
    pub origin: FailureOrigin,
    #[source]
    pub cause: FailureCause,
}

impl Failure {
    pub fn new(origin: FailureOrigin, cause: FailureCause) -> Failure {
        Failure { origin, cause }
    }

    pub fn port_id(&self) -> Option<PortId> {
        match self.origin {
            FailureOrigin::Port { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn port_name(&self) -> Option<&str> {
        match &self.origin {
            FailureOrigin::Port { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Every failure captured during a session, in the order: ports in
/// registration order, then the system listener, then the process thread.
#[derive(Debug)]
pub struct ExecutionFailure {
    first: Box<Failure>,
    rest: Vec<Failure>,
}

impl ExecutionFailure {
    /// Returns `None` when there is nothing to report.
    pub fn from_failures(failures: Vec<Failure>) -> Option<ExecutionFailure> {
        let mut failures = failures.into_iter();
        let first = failures.next()?;
        Some(ExecutionFailure {
            first: Box::new(first),
            rest: failures.collect(),
        })
    }

    pub fn first(&self) -> &Failure {
        &self.first
    }

    pub fn iter(&self) -> impl Iterator<Item = &Failure> {
        std::iter::once(self.first.as_ref()).chain(self.rest.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<Failure> for ExecutionFailure {
    fn from(failure: Failure) -> Self {
        ExecutionFailure {
            first: Box::new(failure),
            rest: Vec::new(),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "error in process thread: {}", self.first)?;
        if !self.rest.is_empty() {
            write!(f, " (and {} more)", self.rest.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.first.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_failure(name: &str) -> Failure {
        Failure::new(
            FailureOrigin::Port {
                id: 3,
                name: name.to_string(),
                callback: Callback::Process,
            },
            FailureCause::Listener("bad things".into()),
        )
    }

    #[test]
    fn failure_names_the_port() {
        let failure = port_failure("BadPort");
        assert_eq!(failure.to_string(), "port \"BadPort\" failed in process: bad things");
        assert_eq!(failure.port_id(), Some(3));
        assert_eq!(failure.port_name(), Some("BadPort"));
    }

    #[test]
    fn execution_failure_reports_the_first_cause() {
        assert!(ExecutionFailure::from_failures(Vec::new()).is_none());
        let failure = ExecutionFailure::from_failures(vec![
            port_failure("first"),
            port_failure("second"),
        ])
        .unwrap();
        assert_eq!(failure.len(), 2);
        assert_eq!(failure.first().port_name(), Some("first"));
        assert!(failure.to_string().ends_with("(and 1 more)"));
        let source = std::error::Error::source(&failure).unwrap();
        assert!(source.to_string().contains("first"));
    }
}
