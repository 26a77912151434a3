use crate::{port::ActivePort, PortId};

/// Structural changes sent to the cycle thread, applied at the start of the
/// next cycle.
pub enum Command {
    AddPort(ActivePort),
    ClosePort(PortId),
}

/// Answer to [`Command::ClosePort`]. `port` is `None` when the port had
/// already left the live set because it failed.
pub struct Retired {
    pub id: PortId,
    pub port: Option<ActivePort>,
}
