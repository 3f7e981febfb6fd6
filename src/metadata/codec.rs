//! Metadata codec: extract, render, and patch the manager's metadata
//! fragment inside a hypervisor-owned domain definition.
//!
//! The definition is treated as an opaque blob with one addressable slot.
//! All patching works on byte spans located with the XML reader, so every
//! byte outside the patched span round-trips untouched. The definition is
//! never deserialized and re-serialized as a whole.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::metadata::{Metadata, VirtualPath};

/// Namespace URI of the metadata fragment.
pub const NAMESPACE: &str = "http://calebstew.art/xmlns/vmm";

/// Preferred namespace prefix, also the fragment's root element name.
pub const PREFIX: &str = "vmm";

/// A half-open byte range inside a definition blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// Everything one scan of a definition learns about where the metadata
/// fragment lives (or could live).
#[derive(Debug, Default)]
struct Slots {
    /// Span of the existing fragment element, if any.
    fragment: Option<Span>,
    /// Offset just past the opening `<metadata>` tag, if one exists.
    metadata_open: Option<usize>,
    /// Span of a self-closing `<metadata/>` tag, if that is all there is.
    metadata_empty: Option<Span>,
    /// Offset of the root element's closing tag.
    root_end: Option<usize>,
}

/// Decode a machine's organizational metadata from its definition.
///
/// A definition without the fragment yields the defaults (path `/`, no
/// labels). A fragment that exists but cannot be understood is an error
/// naming the machine; it is never coerced into defaults, since that would
/// discard whatever organization the user already had.
pub fn decode(machine: &str, definition: &str) -> Result<Metadata> {
    let slots = scan(definition).map_err(|e| Error::MetadataFormat {
        machine: machine.to_string(),
        reason: e.to_string(),
    })?;

    match slots.fragment {
        None => Ok(Metadata::default()),
        Some(span) => parse_fragment(machine, &definition[span.start..span.end]),
    }
}

/// Render metadata as its canonical XML fragment.
///
/// Deterministic: the path element always comes first and labels are
/// emitted in sorted order, so encode/decode cycles are diff-stable.
/// Anything under the namespace that decode ignored is not re-emitted.
pub fn encode(metadata: &Metadata) -> String {
    let mut out = String::new();
    out.push_str(&format!("<{PREFIX}:{PREFIX} xmlns:{PREFIX}=\"{NAMESPACE}\">\n"));
    out.push_str(&format!(
        "  <{PREFIX}:path>{}</{PREFIX}:path>\n",
        escape(metadata.path.as_str())
    ));
    for label in &metadata.labels {
        out.push_str(&format!(
            "  <{PREFIX}:label>{}</{PREFIX}:label>\n",
            escape(label)
        ));
    }
    out.push_str(&format!("</{PREFIX}:{PREFIX}>"));
    out
}

/// Replace the metadata fragment inside a definition, leaving every other
/// byte untouched.
///
/// If the definition has no fragment yet, the fragment is inserted into
/// the existing `<metadata>` element, or a `<metadata>` element is added
/// before the closing root tag.
pub fn merge(definition: &str, fragment: &str) -> Result<String> {
    // Refuse to embed a fragment the decoder would choke on later.
    parse_fragment("(fragment)", fragment)?;

    let slots = scan(definition)?;

    if let Some(span) = slots.fragment {
        return Ok(splice(definition, span, fragment));
    }
    if let Some(offset) = slots.metadata_open {
        let mut out = String::with_capacity(definition.len() + fragment.len());
        out.push_str(&definition[..offset]);
        out.push_str(fragment);
        out.push_str(&definition[offset..]);
        return Ok(out);
    }
    if let Some(span) = slots.metadata_empty {
        return Ok(splice(
            definition,
            span,
            &format!("<metadata>{fragment}</metadata>"),
        ));
    }
    match slots.root_end {
        Some(offset) => {
            let mut out = String::with_capacity(definition.len() + fragment.len());
            out.push_str(&definition[..offset]);
            out.push_str(&format!("<metadata>{fragment}</metadata>\n"));
            out.push_str(&definition[offset..]);
            Ok(out)
        }
        None => Err(Error::Definition {
            reason: "definition has no closing root tag".to_string(),
        }),
    }
}

/// Remove the metadata fragment from a definition, if present.
///
/// Used when deriving a clone's definition: a fresh machine starts with
/// no organizational metadata at all.
pub fn remove(definition: &str) -> Result<String> {
    let slots = scan(definition)?;
    match slots.fragment {
        Some(span) => Ok(splice(definition, span, "")),
        None => Ok(definition.to_string()),
    }
}

fn splice(text: &str, span: Span, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.push_str(&text[..span.start]);
    out.push_str(replacement);
    out.push_str(&text[span.end..]);
    out
}

/// If this element is our fragment root, return the namespace prefix it
/// declares (empty string for a default-namespace declaration).
fn fragment_prefix(element: &BytesStart<'_>) -> Option<String> {
    let mut prefix = None;
    for attr in element.attributes().flatten() {
        if attr.value.as_ref() != NAMESPACE.as_bytes() {
            continue;
        }
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            prefix = Some(String::new());
        } else if let Some(p) = key.strip_prefix(b"xmlns:") {
            prefix = Some(String::from_utf8_lossy(p).into_owned());
        }
    }
    let prefix = prefix?;
    if element.name().as_ref() == qualified(&prefix, PREFIX).as_bytes() {
        Some(prefix)
    } else {
        None
    }
}

fn qualified(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{prefix}:{local}")
    }
}

fn xml_error(e: quick_xml::Error) -> Error {
    Error::Definition {
        reason: format!("XML parse error: {e}"),
    }
}

/// One pass over a definition, locating the fragment and the places a
/// fragment could be inserted.
fn scan(definition: &str) -> Result<Slots> {
    let mut reader = Reader::from_str(definition);
    let mut slots = Slots::default();
    let mut depth = 0usize;

    loop {
        let start = reader.buffer_position();
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                if slots.fragment.is_none() && fragment_prefix(&e).is_some() {
                    let end = skip_subtree(&mut reader)?;
                    slots.fragment = Some(Span { start, end });
                    continue;
                }
                if depth == 1 && e.name().as_ref() == b"metadata" && slots.metadata_open.is_none()
                {
                    slots.metadata_open = Some(reader.buffer_position());
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if slots.fragment.is_none() && fragment_prefix(&e).is_some() {
                    slots.fragment = Some(Span {
                        start,
                        end: reader.buffer_position(),
                    });
                } else if depth == 1
                    && e.name().as_ref() == b"metadata"
                    && slots.metadata_empty.is_none()
                {
                    slots.metadata_empty = Some(Span {
                        start,
                        end: reader.buffer_position(),
                    });
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 && slots.root_end.is_none() {
                    slots.root_end = Some(start);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(slots)
}

/// Consume events until the element opened just before this call closes.
/// Returns the byte offset just past its end tag.
pub(crate) fn skip_subtree(reader: &mut Reader<&[u8]>) -> Result<usize> {
    let mut depth = 1usize;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(reader.buffer_position());
                }
            }
            Event::Eof => {
                return Err(Error::Definition {
                    reason: "unterminated element".to_string(),
                })
            }
            _ => {}
        }
    }
}

/// Parse a standalone fragment (`<vmm:vmm …>…</vmm:vmm>`) into metadata.
///
/// Unknown elements under the namespace are ignored (and therefore dropped
/// on the next write-back); elements in any other namespace inside the
/// fragment are a schema mismatch and fail the decode.
fn parse_fragment(machine: &str, fragment: &str) -> Result<Metadata> {
    let malformed = |reason: String| Error::MetadataFormat {
        machine: machine.to_string(),
        reason,
    };

    let mut reader = Reader::from_str(fragment);
    let prefix;

    // Find the root element and its declared prefix.
    loop {
        match reader.read_event().map_err(|e| malformed(e.to_string()))? {
            Event::Start(e) => {
                prefix = fragment_prefix(&e)
                    .ok_or_else(|| malformed("fragment root is not the expected element".into()))?;
                break;
            }
            Event::Empty(e) => {
                fragment_prefix(&e)
                    .ok_or_else(|| malformed("fragment root is not the expected element".into()))?;
                // An empty fragment element carries the defaults.
                return Ok(Metadata::default());
            }
            Event::Text(_) | Event::Comment(_) | Event::Decl(_) => continue,
            Event::Eof => return Err(malformed("empty metadata fragment".into())),
            other => return Err(malformed(format!("unexpected XML content: {other:?}"))),
        }
    }

    let path_name = qualified(&prefix, "path");
    let label_name = qualified(&prefix, "label");

    let mut path: Option<VirtualPath> = None;
    let mut metadata = Metadata::default();

    loop {
        match reader.read_event().map_err(|e| malformed(e.to_string()))? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == path_name {
                    if path.is_some() {
                        return Err(malformed("duplicate path element".into()));
                    }
                    let text = element_text(&mut reader, machine)?;
                    path = Some(VirtualPath::parse(&text).map_err(|e| {
                        malformed(format!("unparsable path {text:?}: {e}"))
                    })?);
                } else if name == label_name {
                    let text = element_text(&mut reader, machine)?;
                    if text.trim().is_empty() {
                        return Err(malformed("empty label element".into()));
                    }
                    metadata.labels.insert(text);
                } else if same_namespace(&name, &prefix) {
                    // Unknown element under our namespace: skip and drop.
                    skip_subtree(&mut reader)?;
                } else {
                    return Err(malformed(format!("foreign element <{name}> in fragment")));
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == path_name || name == label_name {
                    return Err(malformed(format!("empty <{name}> element")));
                }
                if !same_namespace(&name, &prefix) {
                    return Err(malformed(format!("foreign element <{name}> in fragment")));
                }
            }
            Event::End(_) => break,
            Event::Text(_) | Event::Comment(_) => continue,
            Event::Eof => return Err(malformed("unterminated fragment".into())),
            other => return Err(malformed(format!("unexpected XML content: {other:?}"))),
        }
    }

    metadata.path = path.unwrap_or_default();
    Ok(metadata)
}

fn same_namespace(qname: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        !qname.contains(':')
    } else {
        qname.starts_with(&format!("{prefix}:"))
    }
}

/// Collect the text content of the element just opened, erroring on any
/// nested markup.
fn element_text(reader: &mut Reader<&[u8]>, machine: &str) -> Result<String> {
    let mut text = String::new();
    loop {
        match reader.read_event().map_err(|e| Error::MetadataFormat {
            machine: machine.to_string(),
            reason: e.to_string(),
        })? {
            Event::Text(t) => {
                text.push_str(&t.unescape().map_err(|e| Error::MetadataFormat {
                    machine: machine.to_string(),
                    reason: e.to_string(),
                })?);
            }
            Event::CData(t) => {
                text.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Event::End(_) => return Ok(text),
            Event::Eof => {
                return Err(Error::MetadataFormat {
                    machine: machine.to_string(),
                    reason: "unterminated element".to_string(),
                })
            }
            _ => {
                return Err(Error::MetadataFormat {
                    machine: machine.to_string(),
                    reason: "unexpected markup inside text element".to_string(),
                })
            }
        }
    }
}
