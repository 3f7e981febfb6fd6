pub mod qemu_img;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Where a disk attachment's bytes actually live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// A plain file on a local filesystem; the only kind a copy-on-write
    /// chain can be built on.
    LocalFile(PathBuf),
    /// Anything else (network protocol, block device, storage volume).
    NotLocal { kind: String },
}

/// The disk-image collaborator. Implementations shell out to the image
/// tooling; the clone engine owns rollback, so `delete_image` must succeed
/// on an already-missing target.
#[allow(async_fn_in_trait)]
pub trait ImageStorage {
    /// Create a copy-on-write image at `path` whose backing reference is
    /// exactly `backing`. The backing image is never written to.
    async fn create_cow_image(&self, path: &Path, backing: &Path) -> Result<()>;

    /// Byte-copy an image into a new file, no backing reference.
    async fn copy_image(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Delete an image file. Missing targets are not an error.
    async fn delete_image(&self, path: &Path) -> Result<()>;

    /// Every primary disk attachment in a machine definition.
    fn disk_sources(&self, definition: &str) -> Result<Vec<DiskSource>>;
}

/// Walk a domain definition and report each `device="disk"` attachment's
/// source. CD-ROM and floppy attachments are not primary disks and are
/// skipped. A disk whose `type` is not file-backed reports as
/// [`DiskSource::NotLocal`] with the kind kept for error messages.
pub fn disk_sources(definition: &str) -> Result<Vec<DiskSource>> {
    let mut reader = Reader::from_str(definition);
    let mut sources = Vec::new();

    let mut in_disk = false;
    let mut disk_type = String::new();
    let mut is_primary = false;
    let mut found: Option<DiskSource> = None;

    loop {
        match reader
            .read_event()
            .map_err(|e| anyhow!("XML parse error in definition: {e}"))?
        {
            Event::Start(e) => match e.local_name().as_ref() {
                b"disk" if !in_disk => {
                    let (ty, device) = disk_attrs(&e)?;
                    in_disk = true;
                    is_primary = device == "disk";
                    disk_type = ty;
                    found = None;
                }
                // The live chain is reported under <backingStore> with its
                // own <source> elements; only the top-level source counts.
                b"backingStore" if in_disk => {
                    skip_subtree(&mut reader)?;
                }
                b"source" if in_disk && is_primary && found.is_none() => {
                    found = Some(source_of(&disk_type, &e)?);
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"source" if in_disk && is_primary && found.is_none() => {
                    found = Some(source_of(&disk_type, &e)?);
                }
                b"disk" if !in_disk => {
                    let (ty, device) = disk_attrs(&e)?;
                    if device == "disk" {
                        sources.push(DiskSource::NotLocal {
                            kind: format!("{ty} disk with no source"),
                        });
                    }
                }
                _ => {}
            },
            Event::End(e) => {
                if in_disk && e.local_name().as_ref() == b"disk" {
                    in_disk = false;
                    if is_primary {
                        sources.push(found.take().unwrap_or(DiskSource::NotLocal {
                            kind: format!("{disk_type} disk with no source"),
                        }));
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(sources)
}

/// `type` and `device` attributes of a `<disk>` element, with libvirt's
/// defaults applied when absent.
fn disk_attrs(e: &BytesStart<'_>) -> Result<(String, String)> {
    let mut ty = "file".to_string();
    let mut device = "disk".to_string();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| anyhow!("bad disk attribute: {e}"))?;
        let value = attr
            .unescape_value()
            .map_err(|e| anyhow!("bad disk attribute value: {e}"))?;
        match attr.key.as_ref() {
            b"type" => ty = value.into_owned(),
            b"device" => device = value.into_owned(),
            _ => {}
        }
    }
    Ok((ty, device))
}

fn source_of(disk_type: &str, e: &BytesStart<'_>) -> Result<DiskSource> {
    let mut file = None;
    let mut protocol = None;
    for attr in e.attributes() {
        let attr = attr.map_err(|e| anyhow!("bad source attribute: {e}"))?;
        let value = attr
            .unescape_value()
            .map_err(|e| anyhow!("bad source attribute value: {e}"))?;
        match attr.key.as_ref() {
            b"file" => file = Some(value.into_owned()),
            b"protocol" => protocol = Some(value.into_owned()),
            _ => {}
        }
    }

    Ok(match disk_type {
        "file" => match file {
            Some(path) => DiskSource::LocalFile(PathBuf::from(path)),
            None => DiskSource::NotLocal {
                kind: "file disk with no path".to_string(),
            },
        },
        "network" => DiskSource::NotLocal {
            kind: match protocol {
                Some(p) => format!("network storage ({p})"),
                None => "network storage".to_string(),
            },
        },
        "block" => DiskSource::NotLocal {
            kind: "block device".to_string(),
        },
        "volume" => DiskSource::NotLocal {
            kind: "storage pool volume".to_string(),
        },
        other => DiskSource::NotLocal {
            kind: other.to_string(),
        },
    })
}

fn skip_subtree(reader: &mut Reader<&[u8]>) -> Result<()> {
    let mut depth = 1usize;
    loop {
        match reader
            .read_event()
            .map_err(|e| anyhow!("XML parse error in definition: {e}"))?
        {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(anyhow!("unterminated element in definition")),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(devices: &str) -> String {
        format!("<domain type=\"kvm\"><name>vm1</name><devices>{devices}</devices></domain>")
    }

    #[test]
    fn finds_single_file_disk() {
        let def = definition(
            "<disk type=\"file\" device=\"disk\">\
             <driver name=\"qemu\" type=\"qcow2\"/>\
             <source file=\"/var/lib/libvirt/images/vm1.qcow2\"/>\
             <target dev=\"vda\" bus=\"virtio\"/>\
             </disk>",
        );
        let sources = disk_sources(&def).unwrap();
        assert_eq!(
            sources,
            vec![DiskSource::LocalFile(PathBuf::from(
                "/var/lib/libvirt/images/vm1.qcow2"
            ))]
        );
    }

    #[test]
    fn skips_cdrom_attachments() {
        let def = definition(
            "<disk type=\"file\" device=\"cdrom\">\
             <source file=\"/isos/install.iso\"/>\
             <target dev=\"sda\" bus=\"sata\"/>\
             <readonly/>\
             </disk>\
             <disk type=\"file\" device=\"disk\">\
             <source file=\"/images/root.qcow2\"/>\
             </disk>",
        );
        let sources = disk_sources(&def).unwrap();
        assert_eq!(
            sources,
            vec![DiskSource::LocalFile(PathBuf::from("/images/root.qcow2"))]
        );
    }

    #[test]
    fn reports_network_disk_as_not_local() {
        let def = definition(
            "<disk type=\"network\" device=\"disk\">\
             <source protocol=\"rbd\" name=\"pool/vm1\"/>\
             </disk>",
        );
        let sources = disk_sources(&def).unwrap();
        assert_eq!(
            sources,
            vec![DiskSource::NotLocal {
                kind: "network storage (rbd)".to_string()
            }]
        );
    }

    #[test]
    fn reports_block_disk_as_not_local() {
        let def = definition(
            "<disk type=\"block\" device=\"disk\"><source dev=\"/dev/sdb\"/></disk>",
        );
        assert_eq!(
            disk_sources(&def).unwrap(),
            vec![DiskSource::NotLocal {
                kind: "block device".to_string()
            }]
        );
    }

    #[test]
    fn reports_every_primary_disk() {
        let def = definition(
            "<disk type=\"file\" device=\"disk\"><source file=\"/a.qcow2\"/></disk>\
             <disk type=\"file\" device=\"disk\"><source file=\"/b.qcow2\"/></disk>",
        );
        assert_eq!(disk_sources(&def).unwrap().len(), 2);
    }

    #[test]
    fn no_disks_is_empty() {
        let def = definition("<interface type=\"network\"><source network=\"default\"/></interface>");
        assert!(disk_sources(&def).unwrap().is_empty());
    }

    #[test]
    fn backing_store_chain_is_ignored() {
        let def = definition(
            "<disk type=\"file\" device=\"disk\">\
             <source file=\"/images/child.qcow2\"/>\
             <backingStore type=\"file\">\
             <source file=\"/images/parent.qcow2\"/>\
             </backingStore>\
             <target dev=\"vda\"/>\
             </disk>",
        );
        assert_eq!(
            disk_sources(&def).unwrap(),
            vec![DiskSource::LocalFile(PathBuf::from("/images/child.qcow2"))]
        );
    }

    #[test]
    fn disk_without_source_is_not_local() {
        let def = definition("<disk type=\"file\" device=\"disk\"><target dev=\"vda\"/></disk>");
        assert!(matches!(
            disk_sources(&def).unwrap().as_slice(),
            [DiskSource::NotLocal { .. }]
        ));
    }
}
