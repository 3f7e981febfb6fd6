pub mod codec;

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, MachineRecord};

/// A normalized, purely organizational directory path for machines.
///
/// Always absolute, never ends with a separator except the root itself.
/// Unrelated to any filesystem path: segments only exist because some
/// machine's metadata references them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualPath(String);

impl VirtualPath {
    /// The root path, `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and normalize a user- or metadata-supplied path.
    ///
    /// A missing leading separator is tolerated and repeated separators
    /// collapse, so `work//dev/` and `/work/dev` normalize identically.
    /// `.` and `..` segments are rejected, as are empty input, control
    /// characters, and characters the metadata encoding reserves.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidPath {
                path: raw.to_string(),
                reason: "empty path".to_string(),
            });
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            if segment.is_empty() {
                continue;
            }
            if segment == "." || segment == ".." {
                return Err(Error::InvalidPath {
                    path: raw.to_string(),
                    reason: format!("'{segment}' segments are not allowed"),
                });
            }
            if let Some(c) = segment.chars().find(|c| reserved_char(*c)) {
                return Err(Error::InvalidPath {
                    path: raw.to_string(),
                    reason: format!("segment '{segment}' contains reserved character {c:?}"),
                });
            }
            segments.push(segment);
        }

        if segments.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(format!("/{}", segments.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments in order, empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        let inner = if self.is_root() { "" } else { &self.0[1..] };
        inner.split('/').filter(|s| !s.is_empty())
    }

    /// The containing directory; the root is its own parent.
    pub fn parent(&self) -> VirtualPath {
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self(self.0[..idx].to_string()),
        }
    }

    /// Append one already-normalized segment (as produced by the index).
    pub fn child(&self, segment: &str) -> VirtualPath {
        if self.is_root() {
            Self(format!("/{segment}"))
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for VirtualPath {
    fn default() -> Self {
        Self::root()
    }
}

/// Characters that may not appear in path segments or labels: control
/// characters and the XML-significant set the codec refuses to smuggle
/// through escaping.
fn reserved_char(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | '&' | '"' | '\'')
}

/// Validate a label before it enters the label set.
///
/// Rejected input is an error, never silently sanitized.
pub fn validate_label(label: &str) -> Result<()> {
    if label.trim().is_empty() {
        return Err(Error::InvalidLabel {
            label: label.to_string(),
            reason: "label is empty".to_string(),
        });
    }
    if let Some(c) = label.chars().find(|c| reserved_char(*c)) {
        return Err(Error::InvalidLabel {
            label: label.to_string(),
            reason: format!("contains reserved character {c:?}"),
        });
    }
    Ok(())
}

/// The organizational metadata carried inside a machine's definition:
/// one virtual path plus a deduplicated label set.
///
/// Lifetime matches the machine's own definition: there is no separate
/// store, and deleting the machine deletes its metadata with it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    pub path: VirtualPath,
    pub labels: BTreeSet<String>,
}

impl Metadata {
    /// Move to a new virtual path. Moving to the current path succeeds
    /// and returns an identical value, so repeated moves are idempotent.
    pub fn move_to(&self, raw_path: &str) -> Result<Metadata> {
        let path = VirtualPath::parse(raw_path)?;
        Ok(Metadata {
            path,
            labels: self.labels.clone(),
        })
    }

    /// Add a label to the set. Adding a label that is already present is
    /// a no-op that still succeeds.
    pub fn with_label(&self, label: &str) -> Result<Metadata> {
        validate_label(label)?;
        let mut labels = self.labels.clone();
        labels.insert(label.to_string());
        Ok(Metadata {
            path: self.path.clone(),
            labels,
        })
    }

    /// Remove a label. Absence is not an error.
    pub fn without_label(&self, label: &str) -> Metadata {
        let mut labels = self.labels.clone();
        labels.remove(label);
        Metadata {
            path: self.path.clone(),
            labels,
        }
    }
}

/// Encode `metadata` and patch it into the machine's definition, then
/// push the updated definition through the hypervisor.
///
/// This is the only side-effecting step of a metadata mutation; the
/// mutators themselves are pure. Callers are expected to rebuild their
/// inventory afterwards rather than patch it in place.
pub async fn write_back<H: Hypervisor>(
    hypervisor: &H,
    record: &MachineRecord,
    metadata: &Metadata,
) -> Result<()> {
    let fragment = codec::encode(metadata);
    let updated = codec::merge(&record.definition, &fragment)?;
    hypervisor.update_definition(record.id, &updated).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_separators() {
        assert_eq!(VirtualPath::parse("/work/dev").unwrap().as_str(), "/work/dev");
        assert_eq!(VirtualPath::parse("work/dev").unwrap().as_str(), "/work/dev");
        assert_eq!(VirtualPath::parse("//work///dev/").unwrap().as_str(), "/work/dev");
    }

    #[test]
    fn parse_root_forms() {
        assert_eq!(VirtualPath::parse("/").unwrap(), VirtualPath::root());
        assert_eq!(VirtualPath::parse("///").unwrap(), VirtualPath::root());
        assert!(VirtualPath::root().is_root());
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(matches!(
            VirtualPath::parse(""),
            Err(Error::InvalidPath { .. })
        ));
    }

    #[test]
    fn parse_rejects_dot_segments() {
        assert!(VirtualPath::parse("/work/../other").is_err());
        assert!(VirtualPath::parse("/work/./dev").is_err());
    }

    #[test]
    fn parse_rejects_reserved_characters() {
        assert!(VirtualPath::parse("/work/<dev>").is_err());
        assert!(VirtualPath::parse("/a&b").is_err());
        assert!(VirtualPath::parse("/tab\there").is_err());
    }

    #[test]
    fn segments_iterate_in_order() {
        let path = VirtualPath::parse("/a/b/c").unwrap();
        let segments: Vec<&str> = path.segments().collect();
        assert_eq!(segments, vec!["a", "b", "c"]);
        assert_eq!(VirtualPath::root().segments().count(), 0);
    }

    #[test]
    fn parent_and_child_walk_the_hierarchy() {
        let path = VirtualPath::parse("/a/b").unwrap();
        assert_eq!(path.parent().as_str(), "/a");
        assert_eq!(path.parent().parent(), VirtualPath::root());
        assert_eq!(VirtualPath::root().parent(), VirtualPath::root());
        assert_eq!(VirtualPath::root().child("a").as_str(), "/a");
        assert_eq!(path.child("c").as_str(), "/a/b/c");
    }

    #[test]
    fn move_is_idempotent() {
        let meta = Metadata::default();
        let moved = meta.move_to("/work/dev").unwrap();
        let moved_again = moved.move_to("/work/dev").unwrap();
        assert_eq!(moved, moved_again);
        assert_eq!(moved.path.as_str(), "/work/dev");
    }

    #[test]
    fn move_keeps_labels() {
        let meta = Metadata::default().with_label("debian").unwrap();
        let moved = meta.move_to("/work").unwrap();
        assert!(moved.labels.contains("debian"));
    }

    #[test]
    fn add_then_remove_label_restores_original() {
        let meta = Metadata::default().with_label("keep").unwrap();
        let roundtrip = meta.with_label("debian").unwrap().without_label("debian");
        assert_eq!(meta, roundtrip);
    }

    #[test]
    fn add_label_twice_is_single_entry() {
        let meta = Metadata::default()
            .with_label("debian")
            .unwrap()
            .with_label("debian")
            .unwrap();
        assert_eq!(meta.labels.len(), 1);
    }

    #[test]
    fn remove_missing_label_is_noop() {
        let meta = Metadata::default();
        assert_eq!(meta.without_label("absent"), meta);
    }

    #[test]
    fn label_validation_rejects_empty_and_reserved() {
        assert!(matches!(
            validate_label(""),
            Err(Error::InvalidLabel { .. })
        ));
        assert!(validate_label("   ").is_err());
        assert!(validate_label("a<b").is_err());
        assert!(validate_label("a\"b").is_err());
        assert!(validate_label("line\nbreak").is_err());
        assert!(validate_label("debian").is_ok());
        assert!(validate_label("with space").is_ok());
    }
}
