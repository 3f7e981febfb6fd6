mod cli;
mod clone;
mod config;
mod error;
mod hypervisor;
mod index;
mod menu;
mod metadata;
mod storage;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::hypervisor::virsh::Virsh;
use crate::menu::Menu;
use crate::storage::qemu_img::QemuImg;

#[derive(Parser)]
#[command(
    name = "vmmgr",
    about = "Folder/label organization and linked clones for a libvirt machine inventory"
)]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the interactive browser (the default when no command is given).
    Menu,
    /// List the contents of a virtual folder.
    List {
        /// Virtual folder to list.
        #[arg(default_value = "/")]
        path: String,
    },
    /// List every label in use.
    Tags,
    /// List the machines carrying a label.
    Tag { label: String },
    /// Move a machine to a virtual folder.
    Move { machine: String, path: String },
    /// Add or remove a machine label.
    Label {
        #[command(subcommand)]
        action: LabelAction,
    },
    /// Clone a machine. Linked (copy-on-write) unless --full is given.
    Clone {
        machine: String,
        /// Make an independent byte copy instead of a linked clone.
        #[arg(long)]
        full: bool,
    },
    /// Start a machine (resumes its saved state if one exists).
    Start {
        machine: String,
        /// Discard any saved state and boot fresh.
        #[arg(long)]
        clean: bool,
    },
    /// Ask the guest to shut down.
    Shutdown { machine: String },
    /// Hard power-off.
    Poweroff { machine: String },
    /// Save machine state to disk and stop it.
    Save { machine: String },
}

#[derive(Subcommand)]
enum LabelAction {
    /// Add a label to a machine.
    Add { machine: String, label: String },
    /// Remove a label from a machine. Absent labels are not an error.
    Remove { machine: String, label: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();
    let config = Config::load(args.config.as_deref())?;

    let virsh = Virsh::new(&config.hypervisor);
    let storage = QemuImg::new(config.storage.qemu_img_binary.clone());

    match args.command.unwrap_or(Commands::Menu) {
        Commands::Menu => Menu::new(&virsh, &storage, &config).run().await?,
        Commands::List { path } => cli::run_list(&virsh, &path).await?,
        Commands::Tags => cli::run_tags(&virsh).await?,
        Commands::Tag { label } => cli::run_tag(&virsh, &label).await?,
        Commands::Move { machine, path } => cli::run_move(&virsh, &machine, &path).await?,
        Commands::Label { action } => match action {
            LabelAction::Add { machine, label } => {
                cli::run_label_add(&virsh, &machine, &label).await?
            }
            LabelAction::Remove { machine, label } => {
                cli::run_label_remove(&virsh, &machine, &label).await?
            }
        },
        Commands::Clone { machine, full } => {
            cli::run_clone(&virsh, &storage, &machine, full).await?
        }
        Commands::Start { machine, clean } => cli::run_start(&virsh, &machine, clean).await?,
        Commands::Shutdown { machine } => cli::run_shutdown(&virsh, &machine).await?,
        Commands::Poweroff { machine } => cli::run_poweroff(&virsh, &machine).await?,
        Commands::Save { machine } => cli::run_save(&virsh, &machine).await?,
    }

    Ok(())
}
