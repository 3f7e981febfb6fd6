//! Non-interactive subcommand implementations.
//!
//! Each command rebuilds the inventory from a fresh machine listing; the
//! index is a point-in-time snapshot, never a long-lived cache.

use anyhow::{Context, Result};

use crate::clone::{CloneEngine, CloneMode};
use crate::hypervisor::virsh::Virsh;
use crate::hypervisor::Hypervisor;
use crate::index::{Inventory, MachineEntry};
use crate::metadata::{self, VirtualPath};
use crate::storage::qemu_img::QemuImg;

pub async fn load_inventory(virsh: &Virsh) -> Result<Inventory> {
    let records = virsh.list_machines().await?;
    let inventory = Inventory::build(records);
    for failure in &inventory.failures {
        eprintln!("warning: {failure}");
    }
    Ok(inventory)
}

fn require_machine<'a>(inventory: &'a Inventory, name: &str) -> Result<&'a MachineEntry> {
    inventory
        .machine_named(name)
        .with_context(|| format!("no machine named '{name}'"))
}

/// `vmmgr list [PATH]` — subdirectories first, then machines.
pub async fn run_list(virsh: &Virsh, path: &str) -> Result<()> {
    let path = VirtualPath::parse(path)?;
    let inventory = load_inventory(virsh).await?;
    let listing = inventory.list_children(&path);

    for directory in &listing.directories {
        println!("{directory}/");
    }
    for machine in &listing.machines {
        if machine.metadata.labels.is_empty() {
            println!("{}", machine.record.name);
        } else {
            let labels: Vec<&str> = machine.metadata.labels.iter().map(String::as_str).collect();
            println!("{}  [{}]", machine.record.name, labels.join(", "));
        }
    }
    Ok(())
}

/// `vmmgr tags` — every label in use.
pub async fn run_tags(virsh: &Virsh) -> Result<()> {
    let inventory = load_inventory(virsh).await?;
    for tag in inventory.all_tags() {
        println!("{tag}");
    }
    Ok(())
}

/// `vmmgr tag LABEL` — machines carrying a label, with their paths.
pub async fn run_tag(virsh: &Virsh, label: &str) -> Result<()> {
    let inventory = load_inventory(virsh).await?;
    for machine in inventory.list_by_tag(label) {
        println!("{}\t{}", machine.record.name, machine.metadata.path);
    }
    Ok(())
}

/// `vmmgr move MACHINE PATH`.
pub async fn run_move(virsh: &Virsh, machine: &str, path: &str) -> Result<()> {
    let inventory = load_inventory(virsh).await?;
    let entry = require_machine(&inventory, machine)?;

    let updated = entry.metadata.move_to(path)?;
    metadata::write_back(virsh, &entry.record, &updated).await?;

    println!("moved '{machine}' to '{}'", updated.path);
    Ok(())
}

/// `vmmgr label add MACHINE LABEL`.
pub async fn run_label_add(virsh: &Virsh, machine: &str, label: &str) -> Result<()> {
    let inventory = load_inventory(virsh).await?;
    let entry = require_machine(&inventory, machine)?;

    let updated = entry.metadata.with_label(label)?;
    metadata::write_back(virsh, &entry.record, &updated).await?;

    println!("added label '{label}' to '{machine}'");
    Ok(())
}

/// `vmmgr label remove MACHINE LABEL`. Removing an absent label succeeds.
pub async fn run_label_remove(virsh: &Virsh, machine: &str, label: &str) -> Result<()> {
    let inventory = load_inventory(virsh).await?;
    let entry = require_machine(&inventory, machine)?;

    let updated = entry.metadata.without_label(label);
    metadata::write_back(virsh, &entry.record, &updated).await?;

    println!("removed label '{label}' from '{machine}'");
    Ok(())
}

/// `vmmgr clone MACHINE [--full]`.
pub async fn run_clone(
    virsh: &Virsh,
    storage: &QemuImg,
    machine: &str,
    full: bool,
) -> Result<()> {
    let inventory = load_inventory(virsh).await?;
    let entry = require_machine(&inventory, machine)?;

    let mode = if full {
        CloneMode::Full
    } else {
        CloneMode::Linked
    };
    let outcome = CloneEngine::new(virsh, storage)
        .clone_machine(&entry.record, mode)
        .await?;

    tracing::debug!(id = %outcome.id, "clone registered");
    println!(
        "cloned '{machine}' to '{}' ({} clone, image {})",
        outcome.name,
        mode,
        outcome.image.display()
    );
    Ok(())
}

/// `vmmgr start MACHINE [--clean]`.
pub async fn run_start(virsh: &Virsh, machine: &str, clean: bool) -> Result<()> {
    if clean {
        virsh.start_clean(machine).await?;
        println!("clean-started '{machine}'");
    } else {
        virsh.start(machine).await?;
        println!("started '{machine}'");
    }
    Ok(())
}

/// `vmmgr shutdown MACHINE` — polite guest shutdown request.
pub async fn run_shutdown(virsh: &Virsh, machine: &str) -> Result<()> {
    virsh.shutdown(machine).await?;
    println!("requested shutdown of '{machine}'");
    Ok(())
}

/// `vmmgr poweroff MACHINE` — hard stop.
pub async fn run_poweroff(virsh: &Virsh, machine: &str) -> Result<()> {
    virsh.force_off(machine).await?;
    println!("forced '{machine}' off");
    Ok(())
}

/// `vmmgr save MACHINE` — managed save and stop.
pub async fn run_save(virsh: &Virsh, machine: &str) -> Result<()> {
    virsh.save_state(machine).await?;
    println!("saved state of '{machine}'");
    Ok(())
}
