//! Hypervisor operations backed by the `virsh` CLI.
//!
//! Every call shells out once and blocks on the result; nothing is cached
//! here. Another management client may change the inventory at any time,
//! which is why listings are treated as snapshots by the callers.

use anyhow::{bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::HypervisorConfig;
use crate::hypervisor::{Hypervisor, MachineRecord, MachineState};

/// `virsh` command wrapper bound to one connection URI.
#[derive(Debug, Clone)]
pub struct Virsh {
    binary: String,
    connect_uri: String,
}

impl Virsh {
    pub fn new(config: &HypervisorConfig) -> Self {
        Self {
            binary: config.virsh_binary.clone(),
            connect_uri: config.connect_uri.clone(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(binary = %self.binary, uri = %self.connect_uri, args = ?args, "running virsh");

        let output = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.connect_uri)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "virsh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Submit a definition blob through `virsh define`, which only reads
    /// from a file.
    async fn define_blob(&self, definition: &str) -> Result<()> {
        let path = std::env::temp_dir().join(format!("vmmgr-define-{}.xml", Uuid::new_v4()));
        tokio::fs::write(&path, definition)
            .await
            .with_context(|| format!("failed to stage definition at {}", path.display()))?;

        let path_arg = path.display().to_string();
        let result = self.run(&["define", path_arg.as_str()]).await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "could not remove staged definition");
        }

        result.map(drop)
    }

    // ------------------------------------------------------------------
    // Domain lifecycle. Each of these is a single hypervisor call; state
    // checking and sequencing belong to the caller.
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await.map(drop)
    }

    /// Start while discarding any managed save image.
    #[instrument(skip(self))]
    pub async fn start_clean(&self, name: &str) -> Result<()> {
        self.run(&["start", "--force-boot", name]).await.map(drop)
    }

    #[instrument(skip(self))]
    pub async fn shutdown(&self, name: &str) -> Result<()> {
        self.run(&["shutdown", name]).await.map(drop)
    }

    /// Hard power-off.
    #[instrument(skip(self))]
    pub async fn force_off(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name]).await.map(drop)
    }

    /// Save machine state to a managed save image and stop it.
    #[instrument(skip(self))]
    pub async fn save_state(&self, name: &str) -> Result<()> {
        self.run(&["managedsave", name]).await.map(drop)
    }

    #[instrument(skip(self))]
    pub async fn drop_saved_state(&self, name: &str) -> Result<()> {
        self.run(&["managedsave-remove", name]).await.map(drop)
    }

    /// Whether the machine has a managed save image waiting.
    #[instrument(skip(self))]
    pub async fn has_saved_state(&self, name: &str) -> Result<bool> {
        let output = self.run(&["dominfo", name]).await?;
        Ok(parse_managed_save(&output))
    }
}

impl Hypervisor for Virsh {
    async fn list_machines(&self) -> Result<Vec<MachineRecord>> {
        let output = self.run(&["list", "--all", "--name"]).await?;
        let names = parse_name_list(&output);

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            // A machine can vanish between the listing and the dump when
            // another client undefines it; skip it rather than fail the
            // whole listing.
            let definition = match self
                .run(&["dumpxml", "--inactive", "--security-info", name.as_str()])
                .await
            {
                Ok(xml) => xml,
                Err(e) => {
                    warn!(machine = %name, error = %e, "machine disappeared during listing");
                    continue;
                }
            };

            match domain_uuid(&definition) {
                Ok(id) => records.push(MachineRecord {
                    id,
                    name,
                    definition,
                }),
                Err(e) => {
                    warn!(machine = %name, error = %e, "definition has no usable uuid");
                }
            }
        }

        Ok(records)
    }

    async fn get_definition(&self, id: Uuid) -> Result<String> {
        let id_arg = id.to_string();
        self.run(&["dumpxml", "--inactive", "--security-info", id_arg.as_str()])
            .await
    }

    async fn update_definition(&self, id: Uuid, definition: &str) -> Result<()> {
        debug!(machine = %id, "redefining machine");
        self.define_blob(definition).await
    }

    async fn define_machine(&self, definition: &str) -> Result<Uuid> {
        let id = domain_uuid(definition)
            .context("new machine definition must carry an identity")?;
        self.define_blob(definition).await?;
        Ok(id)
    }

    async fn machine_state(&self, id: Uuid) -> Result<MachineState> {
        let id_arg = id.to_string();
        let output = self.run(&["domstate", id_arg.as_str()]).await?;
        Ok(parse_domstate(&output))
    }

    fn allocate_identity(&self) -> Uuid {
        // Libvirt accepts client-assigned identities; collisions over the
        // v4 space are not a practical concern.
        Uuid::new_v4()
    }
}

/// Parse `virsh list --all --name` output: one name per line, with blank
/// lines sprinkled in.
pub(crate) fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Map `virsh domstate` output onto [`MachineState`].
pub(crate) fn parse_domstate(output: &str) -> MachineState {
    match output.trim() {
        "running" => MachineState::Running,
        "idle" => MachineState::Idle,
        "paused" => MachineState::Paused,
        "in shutdown" => MachineState::InShutdown,
        "shut off" => MachineState::ShutOff,
        "crashed" => MachineState::Crashed,
        "pmsuspended" => MachineState::PmSuspended,
        other => MachineState::Other(other.to_string()),
    }
}

/// Pull the `Managed save:` field out of `virsh dominfo` output.
pub(crate) fn parse_managed_save(output: &str) -> bool {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Managed save:"))
        .map(|value| value.trim() == "yes")
        .unwrap_or(false)
}

/// The root-level `<uuid>` of a domain definition.
pub(crate) fn domain_uuid(definition: &str) -> Result<Uuid> {
    let mut reader = Reader::from_str(definition);
    let mut depth = 0usize;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth == 1 && e.local_name().as_ref() == b"uuid" {
                    let mut text = String::new();
                    loop {
                        match reader.read_event()? {
                            Event::Text(t) => text.push_str(&t.unescape()?),
                            Event::End(_) => break,
                            Event::Eof => bail!("unterminated uuid element"),
                            _ => {}
                        }
                    }
                    return text
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid uuid in definition: {text:?}"));
                }
                depth += 1;
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => bail!("definition has no uuid element"),
            _ => {}
        }
    }
}
