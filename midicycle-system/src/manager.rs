use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::info;
use midicycle_core::transport::Transport;
use midicycle_core::{Architecture, Error, MidiSystem, Result, SystemConfig};
use once_cell::sync::Lazy;

static SYSTEMS: Lazy<Mutex<HashMap<Architecture, MidiSystem>>> = Lazy::new(Default::default);

/// Hands out one shared [`MidiSystem`] per architecture.
pub struct MidiSystemManager;

impl MidiSystemManager {
    /// Returns the session for `architecture`, creating it on first use.
    /// Every call for the same architecture returns a handle to the same
    /// session.
    pub fn system(architecture: Architecture) -> Result<MidiSystem> {
        let mut systems = SYSTEMS.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(system) = systems.get(&architecture) {
            return Ok(system.clone());
        }
        let transport = new_transport(architecture).ok_or(Error::Unavailable(architecture))?;
        let system = MidiSystem::new(transport, SystemConfig::default());
        info!("Created midi system for {}.", architecture);
        systems.insert(architecture, system.clone());
        Ok(system)
    }

    pub fn available_architectures() -> Vec<Architecture> {
        Architecture::ALL
            .iter()
            .copied()
            .filter(|a| MidiSystemManager::is_available(*a))
            .collect()
    }

    pub fn is_available(architecture: Architecture) -> bool {
        new_transport(architecture).map_or(false, |t| t.is_available())
    }

    /// The native architecture of the host platform, if it has one.
    pub fn default_architecture() -> Option<Architecture> {
        if cfg!(target_os = "linux") {
            Some(Architecture::Jack)
        } else if cfg!(target_os = "windows") {
            Some(Architecture::WindowsMm)
        } else {
            None
        }
    }
}

fn new_transport(architecture: Architecture) -> Option<Box<dyn Transport>> {
    match architecture {
        #[cfg(feature = "jack")]
        Architecture::Jack => Some(Box::new(crate::backends::jack::JackTransport::new())),
        _ => None,
    }
}
