//! Clone engine: derive a new machine from an existing one, either as a
//! linked clone (copy-on-write child image chained to the parent) or as a
//! full copy.
//!
//! Disk creation and definition registration have no atomic primitive
//! underneath, so the two are run as a short saga with one compensating
//! action: whenever a later step fails, the image created earlier in the
//! same attempt is deleted before the error surfaces. Callers never have
//! to clean up after a failed clone.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, MachineRecord};
use crate::metadata::codec;
use crate::storage::{DiskSource, ImageStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Copy-on-write child image backed by the parent's current image.
    /// The parent must stay in place for as long as the clone exists.
    Linked,
    /// Independent byte copy of the parent image.
    Full,
}

impl fmt::Display for CloneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linked => write!(f, "linked"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// What a successful clone produced.
#[derive(Debug)]
pub struct CloneOutcome {
    pub id: Uuid,
    pub name: String,
    pub image: PathBuf,
}

pub struct CloneEngine<'a, H, S> {
    hypervisor: &'a H,
    storage: &'a S,
}

impl<'a, H: Hypervisor, S: ImageStorage> CloneEngine<'a, H, S> {
    pub fn new(hypervisor: &'a H, storage: &'a S) -> Self {
        Self {
            hypervisor,
            storage,
        }
    }

    /// Clone a machine. Terminal on success or failure; no partially
    /// created machine or orphaned image is ever left behind.
    pub async fn clone_machine(
        &self,
        source: &MachineRecord,
        mode: CloneMode,
    ) -> Result<CloneOutcome> {
        // Validate: the source must be fully powered off, and its disk
        // must be a single local image file.
        let state = self.hypervisor.machine_state(source.id).await?;
        if !state.is_shut_off() {
            return Err(Error::InvalidState {
                machine: source.name.clone(),
                state: state.to_string(),
                operation: "cloning",
            });
        }

        let definition = self.hypervisor.get_definition(source.id).await?;
        let parent = self.primary_disk(&source.name, &definition)?;

        // Allocate identity: an unused name and a fresh id.
        let existing = self.hypervisor.list_machines().await?;
        let taken: HashSet<String> = existing.into_iter().map(|m| m.name).collect();
        let name = derive_clone_name(&source.name, &taken);
        let id = self.hypervisor.allocate_identity();

        // Disk clone. The parent is only ever read.
        let image = clone_image_path(&parent, &name, mode);
        let disk_result = match mode {
            CloneMode::Linked => self.storage.create_cow_image(&image, &parent).await,
            CloneMode::Full => self.storage.copy_image(&parent, &image).await,
        };
        if let Err(e) = disk_result {
            self.discard_image(&image).await;
            return Err(Error::DiskClone {
                path: image,
                source: e,
            });
        }

        // Rewrite the definition for the new identity. The clone starts
        // with no organizational metadata.
        let rewritten = match rewrite_definition(&definition, &name, id, &image) {
            Ok(xml) => xml,
            Err(e) => {
                self.discard_image(&image).await;
                return Err(e);
            }
        };

        // Register. A rejection rolls the disk back before surfacing.
        match self.hypervisor.define_machine(&rewritten).await {
            Ok(registered) => {
                info!(
                    source = %source.name,
                    clone = %name,
                    image = %image.display(),
                    mode = %mode,
                    "machine cloned"
                );
                Ok(CloneOutcome {
                    id: registered,
                    name,
                    image,
                })
            }
            Err(e) => {
                self.discard_image(&image).await;
                Err(Error::Registration(e))
            }
        }
    }

    fn primary_disk(&self, machine: &str, definition: &str) -> Result<PathBuf> {
        let sources = self
            .storage
            .disk_sources(definition)
            .map_err(|e| Error::Definition {
                reason: e.to_string(),
            })?;

        match sources.as_slice() {
            [DiskSource::LocalFile(path)] => Ok(path.clone()),
            [DiskSource::NotLocal { kind }] => Err(Error::UnsupportedStorage {
                machine: machine.to_string(),
                reason: format!("primary disk is {kind}; a local image file is required"),
            }),
            [] => Err(Error::UnsupportedStorage {
                machine: machine.to_string(),
                reason: "definition has no primary disk".to_string(),
            }),
            many => Err(Error::UnsupportedStorage {
                machine: machine.to_string(),
                reason: format!("expected exactly one primary disk, found {}", many.len()),
            }),
        }
    }

    /// Compensating action of the clone saga. Best-effort: a failed
    /// delete is logged, the original error still wins.
    async fn discard_image(&self, image: &Path) {
        if let Err(e) = self.storage.delete_image(image).await {
            warn!(
                image = %image.display(),
                error = %e,
                "rollback could not delete clone image"
            );
        }
    }
}

/// First unused name of the form `{base}-clone`, `{base}-clone-2`, …
pub(crate) fn derive_clone_name(base: &str, taken: &HashSet<String>) -> String {
    let candidate = format!("{base}-clone");
    if !taken.contains(&candidate) {
        return candidate;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-clone-{n}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Target path for a clone's image: next to the parent, named after the
/// clone. Linked clones are always qcow2; full copies keep the parent's
/// extension.
pub(crate) fn clone_image_path(parent: &Path, name: &str, mode: CloneMode) -> PathBuf {
    let dir = parent.parent().unwrap_or_else(|| Path::new("."));
    let extension = match mode {
        CloneMode::Linked => "qcow2",
        CloneMode::Full => parent
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("img"),
    };
    dir.join(format!("{name}.{extension}"))
}

/// Derive the clone's definition from the source's.
///
/// The field list is fixed: the `<name>` text, the `<uuid>` text (added if
/// the source had none), the primary disk's `<source file=…>`, every
/// interface `<mac address=…/>` (removed so the hypervisor assigns fresh
/// ones), and the manager metadata fragment (removed). Everything else is
/// carried over byte-identical.
pub(crate) fn rewrite_definition(
    definition: &str,
    name: &str,
    id: Uuid,
    disk: &Path,
) -> Result<String> {
    let out = codec::remove(definition)?;
    let out = replace_domain_child_text(&out, "name", name)?;
    let out = set_domain_uuid(&out, id)?;
    let out = replace_primary_disk_source(&out, disk)?;
    strip_mac_addresses(&out)
}

fn xml_error(e: quick_xml::Error) -> Error {
    Error::Definition {
        reason: format!("XML parse error: {e}"),
    }
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Definition {
            reason: format!("bad attribute: {e}"),
        })?;
        if attr.key.as_ref() == key {
            let value = attr.unescape_value().map_err(|e| Error::Definition {
                reason: format!("bad attribute value: {e}"),
            })?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Replace the text of the first `<{element}>` directly under the root.
fn replace_domain_child_text(definition: &str, element: &str, value: &str) -> Result<String> {
    let mut reader = Reader::from_str(definition);
    let mut depth = 0usize;

    loop {
        let start = reader.buffer_position();
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                if depth == 1 && e.local_name().as_ref() == element.as_bytes() {
                    let text_start = reader.buffer_position();
                    let mut inner = 1usize;
                    loop {
                        let pos = reader.buffer_position();
                        match reader.read_event().map_err(xml_error)? {
                            Event::Start(_) => inner += 1,
                            Event::End(_) => {
                                inner -= 1;
                                if inner == 0 {
                                    let mut out = String::with_capacity(definition.len());
                                    out.push_str(&definition[..text_start]);
                                    out.push_str(&escape(value));
                                    out.push_str(&definition[pos..]);
                                    return Ok(out);
                                }
                            }
                            Event::Eof => {
                                return Err(Error::Definition {
                                    reason: format!("unterminated <{element}> element"),
                                })
                            }
                            _ => {}
                        }
                    }
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 1 && e.local_name().as_ref() == element.as_bytes() {
                    let mut out = String::with_capacity(definition.len());
                    out.push_str(&definition[..start]);
                    out.push_str(&format!("<{element}>{}</{element}>", escape(value)));
                    out.push_str(&definition[reader.buffer_position()..]);
                    return Ok(out);
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => {
                return Err(Error::Definition {
                    reason: format!("definition has no <{element}> element"),
                })
            }
            _ => {}
        }
    }
}

/// Replace the root-level `<uuid>` text, inserting the element after
/// `<name>` when the source definition carries none.
fn set_domain_uuid(definition: &str, id: Uuid) -> Result<String> {
    if domain_child_exists(definition, "uuid")? {
        return replace_domain_child_text(definition, "uuid", &id.to_string());
    }

    // Insert right after the name element.
    let mut reader = Reader::from_str(definition);
    let mut depth = 0usize;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                if depth == 1 && e.local_name().as_ref() == b"name" {
                    let end = codec::skip_subtree(&mut reader)?;
                    let mut out = String::with_capacity(definition.len() + 48);
                    out.push_str(&definition[..end]);
                    out.push_str(&format!("\n  <uuid>{id}</uuid>"));
                    out.push_str(&definition[end..]);
                    return Ok(out);
                }
                depth += 1;
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => {
                return Err(Error::Definition {
                    reason: "definition has no <name> element".to_string(),
                })
            }
            _ => {}
        }
    }
}

fn domain_child_exists(definition: &str, element: &str) -> Result<bool> {
    let mut reader = Reader::from_str(definition);
    let mut depth = 0usize;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                if depth == 1 && e.local_name().as_ref() == element.as_bytes() {
                    return Ok(true);
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 1 && e.local_name().as_ref() == element.as_bytes() {
                    return Ok(true);
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => return Ok(false),
            _ => {}
        }
    }
}

/// Point the first primary disk's `<source>` at a new image file,
/// preserving any other attributes the tag carries.
fn replace_primary_disk_source(definition: &str, disk: &Path) -> Result<String> {
    let mut reader = Reader::from_str(definition);
    let mut in_disk = false;
    let mut primary = false;

    loop {
        let start = reader.buffer_position();
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"disk" if !in_disk => {
                    in_disk = true;
                    primary = attr_value(&e, b"device")?.as_deref().unwrap_or("disk") == "disk";
                }
                b"backingStore" if in_disk => {
                    codec::skip_subtree(&mut reader)?;
                }
                b"source" if in_disk && primary => {
                    let end = reader.buffer_position();
                    let tag = rebuild_source_tag(&e, disk, false)?;
                    return Ok(splice(definition, start, end, &tag));
                }
                _ => {}
            },
            Event::Empty(e) => {
                if in_disk && primary && e.local_name().as_ref() == b"source" {
                    let end = reader.buffer_position();
                    let tag = rebuild_source_tag(&e, disk, true)?;
                    return Ok(splice(definition, start, end, &tag));
                }
            }
            Event::End(e) => {
                if in_disk && e.local_name().as_ref() == b"disk" {
                    in_disk = false;
                }
            }
            Event::Eof => {
                return Err(Error::Definition {
                    reason: "definition has no primary disk source".to_string(),
                })
            }
            _ => {}
        }
    }
}

fn rebuild_source_tag(e: &BytesStart<'_>, disk: &Path, self_closing: bool) -> Result<String> {
    let mut tag = String::from("<source");
    let mut replaced = false;
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Definition {
            reason: format!("bad source attribute: {e}"),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "file" {
            tag.push_str(&format!(" file=\"{}\"", escape(&disk.display().to_string())));
            replaced = true;
        } else {
            let value = attr.unescape_value().map_err(|e| Error::Definition {
                reason: format!("bad source attribute value: {e}"),
            })?;
            tag.push_str(&format!(" {key}=\"{}\"", escape(&value)));
        }
    }
    if !replaced {
        tag.push_str(&format!(" file=\"{}\"", escape(&disk.display().to_string())));
    }
    tag.push_str(if self_closing { "/>" } else { ">" });
    Ok(tag)
}

/// Drop every `<mac address=…/>` inside `<interface>` elements so the
/// hypervisor assigns fresh addresses to the clone.
fn strip_mac_addresses(definition: &str) -> Result<String> {
    let mut reader = Reader::from_str(definition);
    let mut in_interface = 0usize;
    let mut spans: Vec<(usize, usize)> = Vec::new();

    loop {
        let start = reader.buffer_position();
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                if e.local_name().as_ref() == b"interface" {
                    in_interface += 1;
                } else if in_interface > 0 && e.local_name().as_ref() == b"mac" {
                    let end = codec::skip_subtree(&mut reader)?;
                    spans.push((start, end));
                }
            }
            Event::Empty(e) => {
                if in_interface > 0 && e.local_name().as_ref() == b"mac" {
                    spans.push((start, reader.buffer_position()));
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"interface" {
                    in_interface = in_interface.saturating_sub(1);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut out = definition.to_string();
    for (start, end) in spans.into_iter().rev() {
        out.replace_range(start..end, "");
    }
    Ok(out)
}

fn splice(text: &str, start: usize, end: usize, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.push_str(&text[..start]);
    out.push_str(replacement);
    out.push_str(&text[end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::MachineState;
    use crate::metadata::{codec, Metadata};
    use anyhow::bail;
    use std::sync::Mutex;

    fn source_definition(name: &str, uuid: &str, disk: &str) -> String {
        format!(
            "<domain type=\"kvm\">\n  \
             <name>{name}</name>\n  \
             <uuid>{uuid}</uuid>\n  \
             <memory unit=\"KiB\">1048576</memory>\n  \
             <devices>\n    \
             <disk type=\"file\" device=\"disk\">\n      \
             <driver name=\"qemu\" type=\"qcow2\"/>\n      \
             <source file=\"{disk}\"/>\n      \
             <target dev=\"vda\" bus=\"virtio\"/>\n    \
             </disk>\n    \
             <interface type=\"network\">\n      \
             <mac address=\"52:54:00:aa:bb:cc\"/>\n      \
             <source network=\"default\"/>\n    \
             </interface>\n  \
             </devices>\n</domain>\n"
        )
    }

    const SOURCE_UUID: &str = "f4722d84-8a42-4f3c-9d6a-111111111111";

    fn source_record(disk: &str) -> MachineRecord {
        MachineRecord {
            id: SOURCE_UUID.parse().unwrap(),
            name: "vm1".to_string(),
            definition: source_definition("vm1", SOURCE_UUID, disk),
        }
    }

    struct MockHypervisor {
        machines: Vec<MachineRecord>,
        state: MachineState,
        fail_define: bool,
        defined: Mutex<Vec<String>>,
        identity: Uuid,
    }

    impl MockHypervisor {
        fn new(machines: Vec<MachineRecord>, state: MachineState) -> Self {
            Self {
                machines,
                state,
                fail_define: false,
                defined: Mutex::new(Vec::new()),
                identity: "9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d".parse().unwrap(),
            }
        }
    }

    impl Hypervisor for MockHypervisor {
        async fn list_machines(&self) -> anyhow::Result<Vec<MachineRecord>> {
            Ok(self.machines.clone())
        }

        async fn get_definition(&self, id: Uuid) -> anyhow::Result<String> {
            match self.machines.iter().find(|m| m.id == id) {
                Some(m) => Ok(m.definition.clone()),
                None => bail!("no machine with id {id}"),
            }
        }

        async fn update_definition(&self, _id: Uuid, _definition: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn define_machine(&self, definition: &str) -> anyhow::Result<Uuid> {
            if self.fail_define {
                bail!("simulated registration failure");
            }
            self.defined.lock().unwrap().push(definition.to_string());
            Ok(self.identity)
        }

        async fn machine_state(&self, _id: Uuid) -> anyhow::Result<MachineState> {
            Ok(self.state.clone())
        }

        fn allocate_identity(&self) -> Uuid {
            self.identity
        }
    }

    #[derive(Default)]
    struct MockStorage {
        sources: Vec<DiskSource>,
        fail_create: bool,
        /// (image, backing) pairs recorded by create_cow_image.
        cow_created: Mutex<Vec<(PathBuf, PathBuf)>>,
        copies: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl MockStorage {
        fn with_local_disk(path: &Path) -> Self {
            Self {
                sources: vec![DiskSource::LocalFile(path.to_path_buf())],
                ..Default::default()
            }
        }
    }

    impl ImageStorage for MockStorage {
        async fn create_cow_image(&self, path: &Path, backing: &Path) -> anyhow::Result<()> {
            if self.fail_create {
                // Leave a partial target behind, like an interrupted write.
                tokio::fs::write(path, b"partial").await?;
                bail!("simulated storage failure");
            }
            tokio::fs::write(path, b"cow image").await?;
            self.cow_created
                .lock()
                .unwrap()
                .push((path.to_path_buf(), backing.to_path_buf()));
            Ok(())
        }

        async fn copy_image(&self, src: &Path, dst: &Path) -> anyhow::Result<()> {
            tokio::fs::copy(src, dst).await?;
            self.copies
                .lock()
                .unwrap()
                .push((src.to_path_buf(), dst.to_path_buf()));
            Ok(())
        }

        async fn delete_image(&self, path: &Path) -> anyhow::Result<()> {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }

        fn disk_sources(&self, _definition: &str) -> anyhow::Result<Vec<DiskSource>> {
            Ok(self.sources.clone())
        }
    }

    /// A parent image inside its own unique directory, so concurrently
    /// running tests never collide on derived clone-image paths.
    fn temp_parent(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vmmgr-clone-{}-{tag}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vm1.qcow2");
        std::fs::write(&path, b"parent image bytes").unwrap();
        path
    }

    fn cleanup(parent: &Path) {
        if let Some(dir) = parent.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn linked_clone_chains_to_parent_exactly() {
        let parent = temp_parent("linked");
        let source = source_record(&parent.display().to_string());
        let hypervisor = MockHypervisor::new(vec![source.clone()], MachineState::ShutOff);
        let storage = MockStorage::with_local_disk(&parent);

        let outcome = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Linked)
            .await
            .unwrap();

        assert_eq!(outcome.name, "vm1-clone");
        let created = storage.cow_created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1, parent, "backing reference must be the parent path verbatim");
        assert_eq!(created[0].0, outcome.image);

        // The parent is read-only throughout.
        assert_eq!(std::fs::read(&parent).unwrap(), b"parent image bytes");

        // The registered definition carries the new identity and no MACs
        // or manager metadata.
        let defined = hypervisor.defined.lock().unwrap();
        assert_eq!(defined.len(), 1);
        assert!(defined[0].contains("<name>vm1-clone</name>"));
        assert!(defined[0].contains(&format!("<uuid>{}</uuid>", hypervisor.identity)));
        assert!(defined[0].contains(&outcome.image.display().to_string()));
        assert!(!defined[0].contains("52:54:00:aa:bb:cc"));

        cleanup(&parent);
    }

    #[tokio::test]
    async fn full_clone_copies_instead_of_chaining() {
        let parent = temp_parent("full");
        let source = source_record(&parent.display().to_string());
        let hypervisor = MockHypervisor::new(vec![source.clone()], MachineState::ShutOff);
        let storage = MockStorage::with_local_disk(&parent);

        let outcome = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Full)
            .await
            .unwrap();

        assert!(storage.cow_created.lock().unwrap().is_empty());
        let copies = storage.copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, parent);
        assert_eq!(std::fs::read(&outcome.image).unwrap(), b"parent image bytes");

        cleanup(&parent);
    }

    #[tokio::test]
    async fn cloning_a_running_machine_is_refused_before_any_disk_work() {
        let parent = temp_parent("running");
        let source = source_record(&parent.display().to_string());
        let hypervisor = MockHypervisor::new(vec![source.clone()], MachineState::Running);
        let storage = MockStorage::with_local_disk(&parent);

        let err = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Linked)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(storage.cow_created.lock().unwrap().is_empty());
        assert!(!clone_image_path(&parent, "vm1-clone", CloneMode::Linked).exists());

        cleanup(&parent);
    }

    #[tokio::test]
    async fn registration_failure_rolls_the_disk_back() {
        let parent = temp_parent("rollback");
        let source = source_record(&parent.display().to_string());
        let mut hypervisor = MockHypervisor::new(vec![source.clone()], MachineState::ShutOff);
        hypervisor.fail_define = true;
        let storage = MockStorage::with_local_disk(&parent);

        let err = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Linked)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Registration(_)));
        let image = clone_image_path(&parent, "vm1-clone", CloneMode::Linked);
        assert!(!image.exists(), "rollback must delete the clone image");

        cleanup(&parent);
    }

    #[tokio::test]
    async fn storage_failure_removes_partial_target() {
        let parent = temp_parent("partial");
        let source = source_record(&parent.display().to_string());
        let hypervisor = MockHypervisor::new(vec![source.clone()], MachineState::ShutOff);
        let mut storage = MockStorage::with_local_disk(&parent);
        storage.fail_create = true;

        let err = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Linked)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DiskClone { .. }));
        let image = clone_image_path(&parent, "vm1-clone", CloneMode::Linked);
        assert!(!image.exists(), "partial target must be removed");

        cleanup(&parent);
    }

    #[tokio::test]
    async fn network_storage_is_rejected() {
        let source = source_record("/irrelevant.qcow2");
        let hypervisor = MockHypervisor::new(vec![source.clone()], MachineState::ShutOff);
        let storage = MockStorage {
            sources: vec![DiskSource::NotLocal {
                kind: "network storage (rbd)".to_string(),
            }],
            ..Default::default()
        };

        let err = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Linked)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedStorage { .. }));
        assert!(err.to_string().contains("rbd"));
    }

    #[tokio::test]
    async fn multiple_disks_are_rejected() {
        let source = source_record("/a.qcow2");
        let hypervisor = MockHypervisor::new(vec![source.clone()], MachineState::ShutOff);
        let storage = MockStorage {
            sources: vec![
                DiskSource::LocalFile(PathBuf::from("/a.qcow2")),
                DiskSource::LocalFile(PathBuf::from("/b.qcow2")),
            ],
            ..Default::default()
        };

        let err = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Linked)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedStorage { .. }));
    }

    #[tokio::test]
    async fn clone_names_skip_taken_ones() {
        let parent = temp_parent("names");
        let source = source_record(&parent.display().to_string());
        let sibling = MachineRecord {
            id: Uuid::new_v4(),
            name: "vm1-clone".to_string(),
            definition: "<domain><name>vm1-clone</name></domain>".to_string(),
        };
        let hypervisor =
            MockHypervisor::new(vec![source.clone(), sibling], MachineState::ShutOff);
        let storage = MockStorage::with_local_disk(&parent);

        let outcome = CloneEngine::new(&hypervisor, &storage)
            .clone_machine(&source, CloneMode::Linked)
            .await
            .unwrap();

        assert_eq!(outcome.name, "vm1-clone-2");

        cleanup(&parent);
    }

    #[test]
    fn derive_clone_name_prefers_plain_suffix() {
        let taken = HashSet::new();
        assert_eq!(derive_clone_name("vm1", &taken), "vm1-clone");
    }

    #[test]
    fn derive_clone_name_counts_up() {
        let taken: HashSet<String> = ["vm1-clone", "vm1-clone-2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(derive_clone_name("vm1", &taken), "vm1-clone-3");
    }

    #[test]
    fn clone_image_paths_sit_next_to_parent() {
        let parent = Path::new("/var/lib/libvirt/images/vm1.qcow2");
        assert_eq!(
            clone_image_path(parent, "vm1-clone", CloneMode::Linked),
            PathBuf::from("/var/lib/libvirt/images/vm1-clone.qcow2")
        );

        let raw_parent = Path::new("/images/vm1.img");
        assert_eq!(
            clone_image_path(raw_parent, "vm1-clone", CloneMode::Full),
            PathBuf::from("/images/vm1-clone.img")
        );
    }

    #[test]
    fn rewrite_replaces_identity_fields_only() {
        let def = source_definition("vm1", SOURCE_UUID, "/images/vm1.qcow2");
        let id: Uuid = "9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d".parse().unwrap();

        let out = rewrite_definition(&def, "vm1-clone", id, Path::new("/images/vm1-clone.qcow2"))
            .unwrap();

        assert!(out.contains("<name>vm1-clone</name>"));
        assert!(out.contains(&format!("<uuid>{id}</uuid>")));
        assert!(out.contains("<source file=\"/images/vm1-clone.qcow2\"/>"));
        assert!(!out.contains("/images/vm1.qcow2"));
        assert!(!out.contains("<mac"));
        // Untouched elements survive byte-identical.
        assert!(out.contains("<memory unit=\"KiB\">1048576</memory>"));
        assert!(out.contains("<driver name=\"qemu\" type=\"qcow2\"/>"));
        assert!(out.contains("<target dev=\"vda\" bus=\"virtio\"/>"));
        assert!(out.contains("<source network=\"default\"/>"));
    }

    #[test]
    fn rewrite_inserts_uuid_when_source_has_none() {
        let def = "<domain type=\"kvm\">\n  <name>vm1</name>\n  <devices>\n    <disk type=\"file\" device=\"disk\"><source file=\"/a.qcow2\"/></disk>\n  </devices>\n</domain>";
        let id: Uuid = "9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d".parse().unwrap();

        let out = rewrite_definition(def, "c", id, Path::new("/c.qcow2")).unwrap();
        assert!(out.contains(&format!("<name>c</name>\n  <uuid>{id}</uuid>")));
    }

    #[test]
    fn rewrite_strips_manager_metadata() {
        let meta = Metadata::default()
            .move_to("/work")
            .unwrap()
            .with_label("debian")
            .unwrap();
        let def = source_definition("vm1", SOURCE_UUID, "/images/vm1.qcow2");
        let def = codec::merge(&def, &codec::encode(&meta)).unwrap();
        let id = Uuid::new_v4();

        let out = rewrite_definition(&def, "c", id, Path::new("/c.qcow2")).unwrap();

        let decoded = codec::decode("c", &out).unwrap();
        assert_eq!(decoded, Metadata::default());
    }

    #[test]
    fn rewrite_preserves_extra_source_attributes() {
        let def = "<domain><name>vm1</name><uuid>f4722d84-8a42-4f3c-9d6a-111111111111</uuid>\
                   <devices><disk type=\"file\" device=\"disk\">\
                   <source file=\"/a.qcow2\" index=\"1\"/>\
                   </disk></devices></domain>";
        let out =
            rewrite_definition(def, "c", Uuid::new_v4(), Path::new("/c.qcow2")).unwrap();
        assert!(out.contains("<source file=\"/c.qcow2\" index=\"1\"/>"));
    }

    #[test]
    fn rewrite_skips_cdrom_sources() {
        let def = "<domain><name>vm1</name><uuid>f4722d84-8a42-4f3c-9d6a-111111111111</uuid>\
                   <devices>\
                   <disk type=\"file\" device=\"cdrom\"><source file=\"/install.iso\"/></disk>\
                   <disk type=\"file\" device=\"disk\"><source file=\"/a.qcow2\"/></disk>\
                   </devices></domain>";
        let out =
            rewrite_definition(def, "c", Uuid::new_v4(), Path::new("/c.qcow2")).unwrap();
        assert!(out.contains("<source file=\"/install.iso\"/>"));
        assert!(out.contains("<source file=\"/c.qcow2\"/>"));
        assert!(!out.contains("/a.qcow2"));
    }
}
