use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the metadata, index, and clone subsystems.
///
/// Collaborator-level failures (virsh, qemu-img) travel as `anyhow::Error`
/// inside the collaborators and are wrapped into the variant the operation
/// dictates at the boundary: disk work into [`Error::DiskClone`],
/// definition registration into [`Error::Registration`], everything else
/// into the transparent [`Error::Hypervisor`].
#[derive(Debug, Error)]
pub enum Error {
    /// Existing metadata on a machine could not be understood. Collected
    /// per machine during index builds, never fatal to a whole listing.
    #[error("malformed manager metadata on machine '{machine}': {reason}")]
    MetadataFormat { machine: String, reason: String },

    /// A label rejected before it ever reaches the encoder.
    #[error("invalid label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    /// A virtual path that cannot be normalized.
    #[error("invalid virtual path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// The machine is in a state that forbids the requested operation.
    #[error("machine '{machine}' is {state}; {operation} requires it to be shut off")]
    InvalidState {
        machine: String,
        state: String,
        operation: &'static str,
    },

    /// Linked clones need exactly one local-file-backed disk.
    #[error("cannot clone machine '{machine}': {reason}")]
    UnsupportedStorage { machine: String, reason: String },

    /// Image creation or copy failed. The partial target has already been
    /// removed by the time this is returned.
    #[error("disk clone to {path:?} failed")]
    DiskClone {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// The hypervisor rejected the rewritten definition. The clone's disk
    /// image has already been rolled back by the time this is returned.
    #[error("hypervisor rejected the new machine definition")]
    Registration(#[source] anyhow::Error),

    /// A hypervisor-owned definition blob could not be parsed or patched.
    #[error("unusable machine definition: {reason}")]
    Definition { reason: String },

    /// Any other hypervisor collaborator failure.
    #[error(transparent)]
    Hypervisor(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
