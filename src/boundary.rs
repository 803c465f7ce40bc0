//! Flat tag-document reading and writing
//!
//! Every filesystem boundary of the system (the telemetry snapshot, the
//! inbound command file, the neighbor-node snapshot and the sharing sidecar)
//! uses the same legacy format: a flat sequence of `<TAG>value</TAG>` entries
//! under a single root element. Register entries use their numeric address as
//! the tag name, which is not well-formed XML, so this module implements a
//! tolerant flat-tag scanner instead of delegating to an XML parser.

use crate::error::{HelionError, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Extract the raw text between `<tag>` and `</tag>`, if present.
pub fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim())
}

/// Extract a numeric tag value. Decimal commas are accepted because some
/// legacy producers write locale-formatted numbers.
pub fn extract_number(text: &str, tag: &str) -> Option<f64> {
    let raw = extract_tag(text, tag)?;
    raw.replace(',', ".").parse::<f64>().ok()
}

/// Extract an integer register value, truncating any fractional part.
pub fn extract_register(text: &str, tag: &str) -> Option<i64> {
    extract_number(text, tag).map(|v| v as i64)
}

/// Read a single register value from a snapshot-format file. Returns `None`
/// when the file or the tag is absent; the caller decides whether that is an
/// error.
pub fn read_register_from_file(path: &Path, register: u16) -> Option<i64> {
    let text = std::fs::read_to_string(path).ok()?;
    extract_register(&text, &register.to_string())
}

/// Builder for a flat tag document.
pub struct TagDoc {
    root: String,
    body: String,
}

impl TagDoc {
    /// Start a document with the given root element name.
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            body: String::new(),
        }
    }

    /// Append one `<tag>value</tag>` entry.
    pub fn push(&mut self, tag: &str, value: impl std::fmt::Display) -> &mut Self {
        let _ = write!(self.body, "<{tag}>{value}</{tag}>");
        self
    }

    /// Render the document with an XML declaration, matching what the legacy
    /// observers expect to find on disk.
    pub fn render(&self) -> String {
        format!(
            "<?xml version='1.0' encoding='utf-8'?><{root}>{body}</{root}>",
            root = self.root,
            body = self.body
        )
    }
}

/// Atomically replace `path` with `content` via a temporary sibling file.
/// Readers never observe a partially written document.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).map_err(|e| {
        HelionError::boundary(format!("write {} failed: {}", tmp.display(), e))
    })?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(HelionError::boundary(format!(
                "replace {} failed: {}",
                path.display(),
                e
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_plain_tag() {
        let text = "<root><ID>42</ID><CMD>07</CMD></root>";
        assert_eq!(extract_tag(text, "ID"), Some("42"));
        assert_eq!(extract_tag(text, "CMD"), Some("07"));
        assert_eq!(extract_tag(text, "VAL"), None);
    }

    #[test]
    fn extract_numeric_tag_names() {
        // register addresses as tag names are not valid XML but must parse
        let text = "<rootmain><1040>950</1040><1090>5000</1090></rootmain>";
        assert_eq!(extract_register(text, "1040"), Some(950));
        assert_eq!(extract_register(text, "1090"), Some(5000));
    }

    #[test]
    fn extract_accepts_decimal_comma() {
        let text = "<r><1090>4999,7</1090></r>";
        assert_eq!(extract_register(text, "1090"), Some(4999));
    }

    #[test]
    fn tagdoc_renders_and_parses_back() {
        let mut doc = TagDoc::new("rootmain");
        doc.push("DATA", "01/08/2026 12:00:00");
        doc.push("1040", 950);
        doc.push("1090", 4321);
        let rendered = doc.render();
        assert!(rendered.starts_with("<?xml version='1.0'"));
        assert_eq!(extract_register(&rendered, "1040"), Some(950));
        assert_eq!(extract_register(&rendered, "1090"), Some(4321));
        assert_eq!(extract_tag(&rendered, "DATA"), Some("01/08/2026 12:00:00"));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.xml");
        write_atomic(&path, "<r><a>1</a></r>").unwrap();
        write_atomic(&path, "<r><a>2</a></r>").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(extract_register(&text, "a"), Some(2));
        // no stray temp file left behind
        assert!(!dir.path().join("doc.tmp").exists());
    }
}
