pub mod virsh;

use std::fmt;

use anyhow::Result;
use uuid::Uuid;

/// One hypervisor-managed machine: stable identity, display name, and the
/// full definition blob the hypervisor holds for it.
///
/// The definition is owned by the hypervisor. This tool only ever reads it
/// and patches the one metadata sub-element it owns; everything else must
/// round-trip byte-identical.
#[derive(Debug, Clone)]
pub struct MachineRecord {
    pub id: Uuid,
    pub name: String,
    pub definition: String,
}

/// Coarse machine runtime state, as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Idle,
    Paused,
    InShutdown,
    ShutOff,
    Crashed,
    PmSuspended,
    /// A state string this tool does not recognize; kept verbatim for
    /// error messages.
    Other(String),
}

impl MachineState {
    /// Whether the machine is fully powered off (the only state cloning
    /// accepts).
    pub fn is_shut_off(&self) -> bool {
        matches!(self, MachineState::ShutOff)
    }

    /// Whether the machine is live in any form.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MachineState::Running | MachineState::Idle | MachineState::Paused | MachineState::InShutdown
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::Paused => write!(f, "paused"),
            Self::InShutdown => write!(f, "in shutdown"),
            Self::ShutOff => write!(f, "shut off"),
            Self::Crashed => write!(f, "crashed"),
            Self::PmSuspended => write!(f, "pmsuspended"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// The hypervisor collaborator. One blocking call at a time; no call here
/// is retried by this tool. Other management clients may mutate the
/// inventory behind our back, which is why callers treat every listing as
/// a point-in-time snapshot and rebuild instead of caching.
#[allow(async_fn_in_trait)]
pub trait Hypervisor {
    /// All defined machines with their current definitions.
    async fn list_machines(&self) -> Result<Vec<MachineRecord>>;

    /// The persistent definition of one machine.
    async fn get_definition(&self, id: Uuid) -> Result<String>;

    /// Replace a machine's definition with a patched one.
    async fn update_definition(&self, id: Uuid, definition: &str) -> Result<()>;

    /// Register a brand-new machine from a definition. Returns its identity.
    async fn define_machine(&self, definition: &str) -> Result<Uuid>;

    /// Current runtime state of a machine.
    async fn machine_state(&self, id: Uuid) -> Result<MachineState>;

    /// A fresh, unused machine identity for a definition about to be
    /// registered.
    fn allocate_identity(&self) -> Uuid;
}
