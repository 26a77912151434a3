//! Callback traits implemented by applications.
//!
//! Every callback may fail by returning an error or by panicking. Either way
//! the failure is contained: it is recorded against the port (or the system)
//! and reported when the port or the system is closed.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::codec::TimedEvent;
use crate::error::FailureCause;
use crate::CycleWindow;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub type ListenerResult = std::result::Result<(), ListenerError>;

pub trait InputPortListener: Send {
    /// Called once per cycle with the events that arrived during the cycle.
    fn process(&mut self, window: &CycleWindow, events: &[TimedEvent]) -> ListenerResult;

    fn on_open(&mut self) -> ListenerResult {
        Ok(())
    }

    fn on_close(&mut self) -> ListenerResult {
        Ok(())
    }
}

pub trait OutputPortListener: Send {
    /// Called once per cycle; push the events to send into `events`, which
    /// arrives empty. Ticks must be ascending and below the window duration.
    fn process(&mut self, window: &CycleWindow, events: &mut Vec<TimedEvent>) -> ListenerResult;

    fn on_open(&mut self) -> ListenerResult {
        Ok(())
    }

    fn on_close(&mut self) -> ListenerResult {
        Ok(())
    }
}

/// System wide notifications. `on_open` and `on_close` run on the thread
/// opening or closing the system, the cycle callbacks on the cycle thread.
pub trait SystemListener: Send {
    fn on_open(&mut self) -> ListenerResult {
        Ok(())
    }

    fn on_close(&mut self) -> ListenerResult {
        Ok(())
    }

    fn on_cycle_start(&mut self, _window: &CycleWindow) -> ListenerResult {
        Ok(())
    }

    fn on_cycle_end(&mut self, _window: &CycleWindow) -> ListenerResult {
        Ok(())
    }

    fn on_connection_changed(&mut self) -> ListenerResult {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopSystemListener;

impl SystemListener for NoopSystemListener {}

/// Runs a listener callback, turning both returned errors and panics into a
/// [`FailureCause`].
pub(crate) fn guarded<F>(callback: F) -> Result<(), FailureCause>
where
    F: FnOnce() -> ListenerResult,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FailureCause::Listener(e)),
        Err(payload) => Err(FailureCause::Panic(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_passes_success() {
        assert!(guarded(|| Ok(())).is_ok());
    }

    #[test]
    fn guarded_captures_errors() {
        match guarded(|| Err("boom".into())) {
            Err(FailureCause::Listener(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn guarded_captures_panics() {
        match guarded(|| panic!("listener exploded")) {
            Err(FailureCause::Panic(message)) => assert_eq!(message, "listener exploded"),
            other => panic!("unexpected {:?}", other),
        }
        let code = 7;
        match guarded(|| panic!("code {}", code)) {
            Err(FailureCause::Panic(message)) => assert_eq!(message, "code 7"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
