use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::port::PortState;
use crate::{Direction, PortId};

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a port id never handed out before in this process.
pub fn next_port_id() -> PortId {
    NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The ports a session knows about, in registration order.
///
/// This is the control side view. The cycle thread keeps its own live set
/// which receives the same changes through the engine's command queue.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: Vec<Arc<PortState>>,
}

impl PortRegistry {
    pub fn new() -> PortRegistry {
        PortRegistry {
            ports: Vec::with_capacity(64),
        }
    }

    pub fn register(&mut self, port: Arc<PortState>) -> PortId {
        let id = port.id();
        self.ports.push(port);
        id
    }

    pub fn unregister(&mut self, id: PortId) -> Option<Arc<PortState>> {
        let idx = self.ports.iter().position(|p| p.id() == id)?;
        Some(self.ports.remove(idx))
    }

    pub fn get(&self, id: PortId) -> Option<&Arc<PortState>> {
        self.ports.iter().find(|p| p.id() == id)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.ports.iter().any(|p| p.name() == name)
    }

    pub fn for_each_input<F: FnMut(&Arc<PortState>)>(&self, f: F) {
        self.ports
            .iter()
            .filter(|p| p.direction() == Direction::Input)
            .for_each(f);
    }

    pub fn for_each_output<F: FnMut(&Arc<PortState>)>(&self, f: F) {
        self.ports
            .iter()
            .filter(|p| p.direction() == Direction::Output)
            .for_each(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PortState>> {
        self.ports.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Arc<PortState>> + '_ {
        self.ports.drain(..)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::PortInfo;

    fn port(name: &str, direction: Direction) -> Arc<PortState> {
        Arc::new(PortState::new(
            next_port_id(),
            name,
            direction,
            PortInfo::default(),
        ))
    }

    #[test]
    fn ids_are_never_reused() {
        let mut registry = PortRegistry::new();
        let first = registry.register(port("a", Direction::Input));
        registry.unregister(first).unwrap();
        let second = registry.register(port("a", Direction::Input));
        assert!(second > first);
        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
    }

    #[test]
    fn iterates_in_registration_order() {
        let mut registry = PortRegistry::new();
        registry.register(port("in1", Direction::Input));
        registry.register(port("out1", Direction::Output));
        registry.register(port("in2", Direction::Input));
        registry.register(port("out2", Direction::Output));

        let mut inputs = Vec::new();
        registry.for_each_input(|p| inputs.push(p.name().to_string()));
        let mut outputs = Vec::new();
        registry.for_each_output(|p| outputs.push(p.name().to_string()));

        assert_eq!(inputs, vec!["in1", "in2"]);
        assert_eq!(outputs, vec!["out1", "out2"]);
    }

    #[test]
    fn tracks_names() {
        let mut registry = PortRegistry::new();
        let id = registry.register(port("synth", Direction::Output));
        assert!(registry.contains_name("synth"));
        assert!(!registry.contains_name("drums"));
        registry.unregister(id);
        assert!(!registry.contains_name("synth"));
        assert!(registry.is_empty());
        assert!(registry.unregister(id).is_none());
    }
}
