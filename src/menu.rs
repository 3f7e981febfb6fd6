//! Interactive fzf-driven browser over the machine inventory.
//!
//! Every browse round rebuilds the inventory from a fresh listing, so
//! changes made by other libvirt clients show up immediately and nothing
//! here ever trusts a stale snapshot across a mutation.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::cli::load_inventory;
use crate::clone::{CloneEngine, CloneMode};
use crate::config::Config;
use crate::hypervisor::virsh::Virsh;
use crate::hypervisor::Hypervisor;
use crate::index::{Inventory, MachineEntry};
use crate::metadata::{self, VirtualPath};
use crate::storage::qemu_img::QemuImg;

#[derive(Debug, Clone, Copy)]
enum Action {
    Start,
    CleanStart,
    Shutdown,
    ForceOff,
    SaveState,
    Restore,
    DropSaved,
    LinkedClone,
    FullClone,
    Move,
    AddLabel,
    RemoveLabel,
}

pub struct Menu<'a> {
    virsh: &'a Virsh,
    storage: &'a QemuImg,
    config: &'a Config,
}

impl<'a> Menu<'a> {
    pub fn new(virsh: &'a Virsh, storage: &'a QemuImg, config: &'a Config) -> Self {
        Self {
            virsh,
            storage,
            config,
        }
    }

    /// Top-level menu loop. Returns when the user aborts out of it.
    pub async fn run(&self) -> Result<()> {
        let options: Vec<String> = vec![
            "Browse folders".to_string(),
            "Browse labels".to_string(),
            "Browse all machines".to_string(),
        ];

        loop {
            let Some(choice) = self.pick("> ", &options).await? else {
                return Ok(());
            };
            match choice {
                0 => self.browse_path().await?,
                1 => self.browse_labels().await?,
                _ => self.browse_all().await?,
            }
        }
    }

    async fn browse_path(&self) -> Result<()> {
        let mut path = VirtualPath::root();

        loop {
            let inventory = load_inventory(self.virsh).await?;
            let listing = inventory.list_children(&path);

            let mut options: Vec<String> = Vec::new();
            let has_up = !path.is_root();
            if has_up {
                options.push("..".to_string());
            }
            let dir_start = options.len();
            options.extend(listing.directories.iter().map(|d| format!("{d}/")));
            let machine_start = options.len();
            options.extend(listing.machines.iter().map(|m| m.record.name.clone()));

            if options.is_empty() {
                self.notify("no machines defined").await;
                return Ok(());
            }

            let Some(choice) = self.pick(&format!("browse[{path}]> "), &options).await? else {
                return Ok(());
            };

            if has_up && choice == 0 {
                path = path.parent();
            } else if choice < machine_start {
                path = path.child(listing.directories[choice - dir_start]);
            } else {
                let name = listing.machines[choice - machine_start].record.name.clone();
                self.machine_menu(&name).await?;
            }
        }
    }

    async fn browse_labels(&self) -> Result<()> {
        loop {
            let inventory = load_inventory(self.virsh).await?;
            let tags: Vec<String> = inventory.all_tags().iter().map(|t| t.to_string()).collect();
            if tags.is_empty() {
                self.notify("no labels defined").await;
                return Ok(());
            }

            let Some(choice) = self.pick("browse[by-label]> ", &tags).await? else {
                return Ok(());
            };
            let tag = &tags[choice];

            let machines: Vec<String> = inventory
                .list_by_tag(tag)
                .iter()
                .map(|m| m.record.name.clone())
                .collect();
            let Some(m) = self
                .pick(&format!("browse[by-label={tag}]> "), &machines)
                .await?
            else {
                continue;
            };

            self.machine_menu(&machines[m]).await?;
        }
    }

    async fn browse_all(&self) -> Result<()> {
        loop {
            let inventory = load_inventory(self.virsh).await?;
            if inventory.is_empty() {
                self.notify("no machines defined").await;
                return Ok(());
            }

            let names: Vec<String> = inventory
                .machines()
                .map(|m| m.record.name.clone())
                .collect();
            let display: Vec<String> = inventory
                .machines()
                .map(|m| format!("{}  ({})", m.record.name, m.metadata.path))
                .collect();

            let Some(choice) = self.pick("browse[all]> ", &display).await? else {
                return Ok(());
            };
            self.machine_menu(&names[choice]).await?;
        }
    }

    /// Per-machine action menu. Offered actions depend on the machine's
    /// current state, re-queried on every round.
    async fn machine_menu(&self, name: &str) -> Result<()> {
        loop {
            let inventory = load_inventory(self.virsh).await?;
            let Some(entry) = inventory.machine_named(name) else {
                // Deleted behind our back; nothing to act on.
                return Ok(());
            };
            let entry = entry.clone();

            let state = self.virsh.machine_state(entry.record.id).await?;
            let saved = self.virsh.has_saved_state(name).await?;

            let mut actions: Vec<(&str, Action)> = Vec::new();
            if state.is_active() {
                actions.push(("Shutdown", Action::Shutdown));
                actions.push(("Force off", Action::ForceOff));
                actions.push(("Save state", Action::SaveState));
            } else if saved {
                actions.push(("Restore saved state", Action::Restore));
                actions.push(("Discard saved state", Action::DropSaved));
                actions.push(("Discard saved state and start", Action::CleanStart));
            } else {
                actions.push(("Start", Action::Start));
            }
            actions.push(("Clone (linked)", Action::LinkedClone));
            actions.push(("Clone (full)", Action::FullClone));
            actions.push(("Move to…", Action::Move));
            actions.push(("Add label", Action::AddLabel));
            actions.push(("Remove label", Action::RemoveLabel));

            let labels: Vec<String> = actions.iter().map(|(l, _)| l.to_string()).collect();
            let prompt = format!("machine[{}]> ", entry.metadata.path.child(name));
            let Some(choice) = self.pick(&prompt, &labels).await? else {
                return Ok(());
            };

            // User-input and state errors are recoverable: report and
            // re-prompt instead of unwinding out of the menu.
            if let Err(e) = self.perform(&entry, actions[choice].1, &inventory).await {
                warn!(machine = %name, error = %e, "action failed");
                self.notify(&format!("error: {e}")).await;
            }
        }
    }

    async fn perform(
        &self,
        entry: &MachineEntry,
        action: Action,
        inventory: &Inventory,
    ) -> Result<()> {
        let name = &entry.record.name;
        match action {
            Action::Start | Action::Restore => {
                self.virsh.start(name).await?;
                self.notify(&format!("starting machine '{name}'")).await;
            }
            Action::CleanStart => {
                self.virsh.start_clean(name).await?;
                self.notify(&format!("clean-starting machine '{name}'")).await;
            }
            Action::Shutdown => {
                self.virsh.shutdown(name).await?;
                self.notify(&format!("requested shutdown of '{name}'")).await;
            }
            Action::ForceOff => {
                self.virsh.force_off(name).await?;
                self.notify(&format!("forced machine '{name}' off")).await;
            }
            Action::SaveState => {
                self.virsh.save_state(name).await?;
                self.notify(&format!("saved state of machine '{name}'")).await;
            }
            Action::DropSaved => {
                self.virsh.drop_saved_state(name).await?;
                self.notify(&format!("discarded saved state of '{name}'")).await;
            }
            Action::LinkedClone | Action::FullClone => {
                let mode = match action {
                    Action::LinkedClone => CloneMode::Linked,
                    _ => CloneMode::Full,
                };
                let outcome = CloneEngine::new(self.virsh, self.storage)
                    .clone_machine(&entry.record, mode)
                    .await?;
                self.notify(&format!("cloned '{name}' to '{}'", outcome.name))
                    .await;
            }
            Action::Move => {
                let mut options: Vec<String> = vec!["+ New folder".to_string()];
                options.extend(inventory.known_paths().iter().map(|p| p.to_string()));

                let Some(choice) = self.pick(&format!("move[{name}]> "), &options).await? else {
                    return Ok(());
                };
                let target = if choice == 0 {
                    match self.ask(&format!("new-folder[{name}]> "), &[]).await? {
                        Some(path) => path,
                        None => return Ok(()),
                    }
                } else {
                    options[choice].clone()
                };

                let updated = entry.metadata.move_to(&target)?;
                metadata::write_back(self.virsh, &entry.record, &updated).await?;
                self.notify(&format!("moved '{name}' to '{}'", updated.path))
                    .await;
            }
            Action::AddLabel => {
                let suggestions: Vec<String> =
                    inventory.all_tags().iter().map(|t| t.to_string()).collect();
                let Some(label) = self
                    .ask(&format!("add-label[{name}]> "), &suggestions)
                    .await?
                else {
                    return Ok(());
                };

                let updated = entry.metadata.with_label(&label)?;
                metadata::write_back(self.virsh, &entry.record, &updated).await?;
                self.notify(&format!("added label '{label}' to '{name}'"))
                    .await;
            }
            Action::RemoveLabel => {
                let labels: Vec<String> = entry.metadata.labels.iter().cloned().collect();
                if labels.is_empty() {
                    self.notify(&format!("no labels on '{name}'")).await;
                    return Ok(());
                }
                let Some(choice) = self.pick(&format!("remove-label[{name}]> "), &labels).await?
                else {
                    return Ok(());
                };

                let updated = entry.metadata.without_label(&labels[choice]);
                metadata::write_back(self.virsh, &entry.record, &updated).await?;
                self.notify(&format!("removed label '{}' from '{name}'", labels[choice]))
                    .await;
            }
        }
        Ok(())
    }

    /// Run fzf over a list of options; `None` when the user aborts.
    async fn pick(&self, prompt: &str, options: &[String]) -> Result<Option<usize>> {
        if options.is_empty() {
            return Ok(None);
        }

        let mut child = Command::new(&self.config.menu.fzf_binary)
            .arg("--prompt")
            .arg(prompt)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .context("failed to launch fzf")?;

        let mut stdin = child.stdin.take().context("fzf stdin unavailable")?;
        stdin.write_all(options.join("\n").as_bytes()).await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("fzf did not exit cleanly")?;
        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let selection = stdout.trim_end_matches('\n');
        Ok(options.iter().position(|o| o == selection))
    }

    /// Free-form input with completion suggestions; the typed query wins
    /// when nothing is selected.
    async fn ask(&self, prompt: &str, suggestions: &[String]) -> Result<Option<String>> {
        let mut child = Command::new(&self.config.menu.fzf_binary)
            .arg("--prompt")
            .arg(prompt)
            .arg("--print-query")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .context("failed to launch fzf")?;

        let mut stdin = child.stdin.take().context("fzf stdin unavailable")?;
        stdin.write_all(suggestions.join("\n").as_bytes()).await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("fzf did not exit cleanly")?;
        // fzf exits 130 on abort; 1 just means the query matched nothing,
        // which is fine for free-form input.
        if output.status.code() == Some(130) {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let query = lines.next().unwrap_or("").trim();
        let selection = lines.next().map(str::trim).filter(|s| !s.is_empty());

        let answer = selection.unwrap_or(query);
        if answer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(answer.to_string()))
        }
    }

    /// Desktop notification, degrading to a log line.
    async fn notify(&self, message: &str) {
        if self.config.menu.notifications {
            let sent = Command::new("notify-send")
                .arg("Virtual Machine Manager")
                .arg(message)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if sent.map(|s| s.success()).unwrap_or(false) {
                return;
            }
        }
        info!("{message}");
    }
}
