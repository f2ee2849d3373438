//! File-list serialization: the `FileListing` XML document, optionally
//! bzip2-compressed (detected by the `.bz2` filename suffix).
//!
//! The reader is strict about the parts the engine depends on: exactly one
//! root element with a version attribute, decimal sizes, 39-character base32
//! TTH values, `Incomplete` limited to `0`/`1`, and no nested content inside
//! file elements. Some producers emit the raw byte `0x1D` in names; it is
//! rewritten to `?` before parsing.

use super::{FileTree, NodeId, NodeKind};
use crate::tth;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug)]
pub enum FlXmlError {
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    InvalidUtf8,
    Parse(String),
}

impl std::fmt::Display for FlXmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "file list I/O error on '{}': {source}", path.display())
            }
            Self::InvalidUtf8 => write!(f, "file list is not valid UTF-8"),
            Self::Parse(msg) => write!(f, "invalid file list: {msg}"),
        }
    }
}

impl std::error::Error for FlXmlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn parse_err(msg: impl Into<String>) -> FlXmlError {
    FlXmlError::Parse(msg.into())
}

// -- reader ------------------------------------------------------------

struct XmlElem {
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlElem>,
}

impl XmlElem {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn byte(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self
            .byte()
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn skip_misc(&mut self) -> Result<(), FlXmlError> {
        loop {
            self.skip_ws();
            if self.rest().starts_with("<?") {
                let end = self
                    .rest()
                    .find("?>")
                    .ok_or_else(|| parse_err("unterminated processing instruction"))?;
                self.pos += end + 2;
            } else if self.rest().starts_with("<!--") {
                let end = self
                    .rest()
                    .find("-->")
                    .ok_or_else(|| parse_err("unterminated comment"))?;
                self.pos += end + 3;
            } else if self.rest().starts_with("<!") {
                let end = self
                    .rest()
                    .find('>')
                    .ok_or_else(|| parse_err("unterminated declaration"))?;
                self.pos += end + 1;
            } else {
                return Ok(());
            }
        }
    }

    fn parse_name(&mut self) -> Result<String, FlXmlError> {
        let start = self.pos;
        while self
            .byte()
            .is_some_and(|b| !b.is_ascii_whitespace() && b != b'>' && b != b'/' && b != b'=')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(parse_err("expected a name"));
        }
        Ok(self.text[start..self.pos].to_string())
    }

    fn parse_attr(&mut self) -> Result<(String, String), FlXmlError> {
        let key = self.parse_name()?;
        self.skip_ws();
        if self.byte() != Some(b'=') {
            return Err(parse_err(format!("attribute `{key}' has no value")));
        }
        self.pos += 1;
        self.skip_ws();
        let quote = self
            .byte()
            .filter(|&b| b == b'"' || b == b'\'')
            .ok_or_else(|| parse_err("unquoted attribute value"))?;
        self.pos += 1;
        let start = self.pos;
        while self.byte().is_some_and(|b| b != quote) {
            self.pos += 1;
        }
        if self.byte() != Some(quote) {
            return Err(parse_err("unterminated attribute value"));
        }
        let raw = &self.text[start..self.pos];
        self.pos += 1;
        Ok((key, decode_entities(raw)?))
    }

    fn parse_element(&mut self) -> Result<XmlElem, FlXmlError> {
        if self.byte() != Some(b'<') {
            return Err(parse_err("expected an element"));
        }
        self.pos += 1;
        let tag = self.parse_name()?;
        let mut attrs = Vec::new();
        loop {
            self.skip_ws();
            match self.byte() {
                Some(b'/') => {
                    self.pos += 1;
                    if self.byte() != Some(b'>') {
                        return Err(parse_err("malformed empty-element tag"));
                    }
                    self.pos += 1;
                    return Ok(XmlElem {
                        tag,
                        attrs,
                        children: Vec::new(),
                    });
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => attrs.push(self.parse_attr()?),
                None => return Err(parse_err("unterminated start tag")),
            }
        }

        let mut children = Vec::new();
        loop {
            self.skip_misc()?;
            if self.rest().starts_with("</") {
                self.pos += 2;
                let close = self.parse_name()?;
                if close != tag {
                    return Err(parse_err(format!(
                        "mismatched close tag: <{tag}> ended by </{close}>"
                    )));
                }
                self.skip_ws();
                if self.byte() != Some(b'>') {
                    return Err(parse_err("malformed close tag"));
                }
                self.pos += 1;
                return Ok(XmlElem {
                    tag,
                    attrs,
                    children,
                });
            }
            match self.byte() {
                Some(b'<') => children.push(self.parse_element()?),
                Some(_) => {
                    // Character data is not meaningful in a file list; skip
                    // to the next markup.
                    match self.rest().find('<') {
                        Some(off) => self.pos += off,
                        None => self.pos = self.text.len(),
                    }
                }
                None => return Err(parse_err(format!("<{tag}> is never closed"))),
            }
        }
    }
}

fn decode_entities(input: &str) -> Result<String, FlXmlError> {
    if !input.contains('&') {
        return Ok(input.to_string());
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp + 1..];
        let semi = rest
            .find(';')
            .ok_or_else(|| parse_err("unterminated entity"))?;
        let entity = &rest[..semi];
        rest = &rest[semi + 1..];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ if entity.starts_with('#') => {
                let code = if let Some(hex) = entity.strip_prefix("#x").or(entity.strip_prefix("#X"))
                {
                    u32::from_str_radix(hex, 16).ok()
                } else {
                    entity[1..].parse().ok()
                };
                let c = code
                    .and_then(char::from_u32)
                    .ok_or_else(|| parse_err(format!("bad character reference &{entity};")))?;
                out.push(c);
            }
            _ => return Err(parse_err(format!("unknown entity &{entity};"))),
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

/// Parses a (decompressed) file-list document into a tree.
pub fn parse_filelist(raw: &[u8]) -> Result<FileTree, FlXmlError> {
    // Some clients substitute 0x1D for bytes they cannot encode.
    let cleaned: Vec<u8> = raw
        .iter()
        .map(|&b| if b == 0x1d { b'?' } else { b })
        .collect();
    let text = std::str::from_utf8(&cleaned).map_err(|_| FlXmlError::InvalidUtf8)?;

    let mut cur = Cursor { text, pos: 0 };
    cur.skip_misc()?;
    let root = cur.parse_element()?;
    cur.skip_misc()?;
    if cur.pos != text.len() {
        return Err(parse_err("content after the root element"));
    }
    if root.tag != "FileListing" {
        return Err(parse_err(format!("unexpected root element <{}>", root.tag)));
    }
    if root.attr("Version").is_none() {
        return Err(parse_err("root element has no Version attribute"));
    }

    let mut tree = FileTree::new();
    let root_id = tree.root();
    for child in &root.children {
        convert_elem(&mut tree, root_id, child)?;
    }
    sort_recursive(&mut tree, root_id);
    Ok(tree)
}

fn convert_elem(tree: &mut FileTree, parent: NodeId, elem: &XmlElem) -> Result<(), FlXmlError> {
    match elem.tag.as_str() {
        "Directory" => {
            let name = elem
                .attr("Name")
                .ok_or_else(|| parse_err("directory without Name"))?;
            let incomplete = match elem.attr("Incomplete") {
                None | Some("0") => false,
                Some("1") => true,
                Some(other) => {
                    return Err(parse_err(format!("bad Incomplete value: {other}")));
                }
            };
            let dir = tree
                .create_dir(name, incomplete)
                .map_err(|e| parse_err(e.to_string()))?;
            tree.add_unsorted(parent, dir)
                .map_err(|e| parse_err(e.to_string()))?;
            for child in &elem.children {
                convert_elem(tree, dir, child)?;
            }
            Ok(())
        }
        "File" => {
            if !elem.children.is_empty() {
                return Err(parse_err("file element with nested content"));
            }
            let name = elem
                .attr("Name")
                .ok_or_else(|| parse_err("file without Name"))?;
            let size_str = elem
                .attr("Size")
                .ok_or_else(|| parse_err("file without Size"))?;
            if size_str.is_empty() || !size_str.bytes().all(|b| b.is_ascii_digit()) {
                return Err(parse_err(format!("bad Size value: {size_str}")));
            }
            let size: u64 = size_str
                .parse()
                .map_err(|_| parse_err(format!("Size out of range: {size_str}")))?;
            let tth_str = elem
                .attr("TTH")
                .ok_or_else(|| parse_err("file without TTH"))?;
            let digest = tth::tth_from_str(tth_str)
                .ok_or_else(|| parse_err(format!("malformed TTH: {tth_str}")))?;
            let file = tree
                .create_file(name, size, Some(digest), None)
                .map_err(|e| parse_err(e.to_string()))?;
            tree.add_unsorted(parent, file)
                .map_err(|e| parse_err(e.to_string()))?;
            Ok(())
        }
        // Unknown elements are skipped for forward compatibility.
        _ => Ok(()),
    }
}

fn sort_recursive(tree: &mut FileTree, dir: NodeId) {
    tree.sort(dir);
    let children: Vec<NodeId> = tree.node(dir).children().to_vec();
    for c in children {
        if !tree.node(c).is_file() {
            sort_recursive(tree, c);
        }
    }
}

// -- writer ------------------------------------------------------------

/// Serializes a tree into a `FileListing` document. Files without a TTH are
/// not representable in the format and are omitted.
pub fn serialize_filelist(tree: &FileTree, generator: &str) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
    out.push_str("<FileListing Version=\"1\" Base=\"/\" Generator=\"");
    escape_attr(generator, &mut out);
    out.push_str("\">\n");
    for &c in tree.node(tree.root()).children() {
        write_node(tree, c, 1, &mut out);
    }
    out.push_str("</FileListing>\n");
    out
}

fn write_node(tree: &FileTree, id: NodeId, depth: usize, out: &mut String) {
    let node = tree.node(id);
    for _ in 0..depth {
        out.push('\t');
    }
    match &node.kind {
        NodeKind::Dir {
            children,
            incomplete,
            ..
        } => {
            out.push_str("<Directory Name=\"");
            escape_attr(node.name(), out);
            out.push('"');
            if *incomplete {
                out.push_str(" Incomplete=\"1\"");
            }
            if children.is_empty() {
                out.push_str("/>\n");
                return;
            }
            out.push_str(">\n");
            for &c in children {
                write_node(tree, c, depth + 1, out);
            }
            for _ in 0..depth {
                out.push('\t');
            }
            out.push_str("</Directory>\n");
        }
        NodeKind::File { size, tth, .. } => {
            let Some(digest) = tth else { return };
            out.push_str("<File Name=\"");
            escape_attr(node.name(), out);
            out.push_str("\" Size=\"");
            out.push_str(&size.to_string());
            out.push_str("\" TTH=\"");
            out.push_str(&tth::base32_encode(digest));
            out.push_str("\"/>\n");
        }
    }
}

// -- file I/O ----------------------------------------------------------

fn is_bz2(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "bz2")
}

/// Reads and parses a file list from disk; bzip2 is detected by suffix.
pub fn load_from_file(path: &Path) -> Result<FileTree, FlXmlError> {
    let raw = std::fs::read(path).map_err(|source| FlXmlError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let data = if is_bz2(path) {
        let mut out = Vec::new();
        BzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|source| FlXmlError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        out
    } else {
        raw
    };
    parse_filelist(&data)
}

/// Serializes and writes a file list, compressing when the suffix asks for it.
pub fn save_to_file(tree: &FileTree, path: &Path, generator: &str) -> Result<(), FlXmlError> {
    let doc = serialize_filelist(tree, generator);
    let io_err = |source| FlXmlError::Io {
        path: path.to_path_buf(),
        source,
    };
    if is_bz2(path) {
        let file = std::fs::File::create(path).map_err(io_err)?;
        let mut enc = BzEncoder::new(file, bzip2::Compression::default());
        enc.write_all(doc.as_bytes()).map_err(io_err)?;
        enc.finish().map_err(io_err)?;
    } else {
        std::fs::write(path, doc).map_err(io_err)?;
    }
    Ok(())
}

/// Loads a remote user's list on a worker thread; the future completes on the
/// caller's context. Parsing can take a while on large lists, so it must not
/// run on the event loop.
pub async fn load_remote(path: std::path::PathBuf) -> Result<FileTree, FlXmlError> {
    match tokio::task::spawn_blocking(move || load_from_file(&path)).await {
        Ok(result) => result,
        Err(join_err) => Err(FlXmlError::Parse(format!(
            "file list worker failed: {join_err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fl::NodeKind;
    use std::path::PathBuf;

    fn sample() -> FileTree {
        let mut t = FileTree::new();
        let d = t.create_dir("Share & Co", false).unwrap();
        t.add(t.root(), d).unwrap();
        let f = t
            .create_file("song <1>.mp3", 4096, Some([7u8; 24]), None)
            .unwrap();
        t.add(d, f).unwrap();
        let empty = t.create_dir("empty", true).unwrap();
        t.add(t.root(), empty).unwrap();
        t
    }

    fn trees_equal(a: &FileTree, b: &FileTree, an: super::NodeId, bn: super::NodeId) -> bool {
        let (x, y) = (a.node(an), b.node(bn));
        if x.name() != y.name() || x.size() != y.size() || x.is_file() != y.is_file() {
            return false;
        }
        if x.tth() != y.tth() {
            return false;
        }
        let (xc, yc) = (x.children(), y.children());
        xc.len() == yc.len()
            && xc
                .iter()
                .zip(yc.iter())
                .all(|(&c1, &c2)| trees_equal(a, b, c1, c2))
    }

    #[test]
    fn roundtrip_preserves_tree() {
        let t = sample();
        let doc = serialize_filelist(&t, "rust-dc 0.1");
        let back = parse_filelist(doc.as_bytes()).expect("parse");
        assert!(trees_equal(&t, &back, t.root(), back.root()));
    }

    #[test]
    fn incomplete_attribute_roundtrips() {
        let t = sample();
        let doc = serialize_filelist(&t, "g");
        assert!(doc.contains("Incomplete=\"1\""));
        let back = parse_filelist(doc.as_bytes()).expect("parse");
        let empty = back.find(back.root(), "empty", false).unwrap();
        assert!(back.node(empty).is_incomplete());
    }

    #[test]
    fn parses_minimal_document() {
        let doc = br#"<?xml version="1.0"?>
<FileListing Version="1" Base="/" Generator="x">
  <Directory Name="d">
    <File Name="f" Size="10" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/>
  </Directory>
  <Directory Name="e"/>
</FileListing>"#;
        let t = parse_filelist(doc).expect("parse");
        let d = t.find(t.root(), "d", false).unwrap();
        let f = t.find(d, "f", false).unwrap();
        assert_eq!(t.node(f).size(), 10);
        assert_eq!(t.node(f).tth(), Some(&[0u8; 24]));
        assert!(t.find(t.root(), "e", false).is_some());
        assert_eq!(t.node(t.root()).size(), 10);
    }

    #[test]
    fn rejects_missing_version() {
        let doc = b"<FileListing Base=\"/\"></FileListing>";
        assert!(parse_filelist(doc).is_err());
    }

    #[test]
    fn rejects_second_root() {
        let doc = b"<FileListing Version=\"1\"/><FileListing Version=\"1\"/>";
        assert!(parse_filelist(doc).is_err());
    }

    #[test]
    fn rejects_bad_file_fields() {
        let tth = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        for doc in [
            format!(r#"<FileListing Version="1"><File Name="f" Size="-1" TTH="{tth}"/></FileListing>"#),
            format!(r#"<FileListing Version="1"><File Name="f" Size="1x" TTH="{tth}"/></FileListing>"#),
            r#"<FileListing Version="1"><File Name="f" Size="1" TTH="short"/></FileListing>"#.to_string(),
            format!(r#"<FileListing Version="1"><File Name="f" Size="1" TTH="{tth}"><File Name="g" Size="1" TTH="{tth}"/></File></FileListing>"#),
            format!(r#"<FileListing Version="1"><Directory Name="d" Incomplete="2"><File Name="f" Size="1" TTH="{tth}"/></Directory></FileListing>"#),
        ] {
            assert!(parse_filelist(doc.as_bytes()).is_err(), "accepted: {doc}");
        }
    }

    #[test]
    fn rewrites_group_separator_byte() {
        let mut doc =
            b"<FileListing Version=\"1\"><Directory Name=\"a_b\"/></FileListing>".to_vec();
        let idx = doc.windows(3).position(|w| w == b"a_b").unwrap() + 1;
        doc[idx] = 0x1d;
        let t = parse_filelist(&doc).expect("parse");
        assert!(t.find(t.root(), "a?b", true).is_some());
    }

    #[test]
    fn entity_escaping_roundtrips() {
        let t = sample();
        let doc = serialize_filelist(&t, "g");
        assert!(doc.contains("Share &amp; Co"));
        assert!(doc.contains("song &lt;1&gt;.mp3"));
        let back = parse_filelist(doc.as_bytes()).expect("parse");
        assert!(back.find(back.root(), "Share & Co", true).is_some());
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-dc-flxml-{tag}-{nanos}"));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn bz2_suffix_compresses() {
        let dir = temp_dir("bz2");
        let t = sample();
        let plain = dir.join("list.xml");
        let packed = dir.join("list.xml.bz2");
        save_to_file(&t, &plain, "g").expect("save plain");
        save_to_file(&t, &packed, "g").expect("save bz2");
        // The compressed file is not raw XML.
        let raw = std::fs::read(&packed).expect("read");
        assert!(!raw.starts_with(b"<?xml"));
        let a = load_from_file(&plain).expect("load plain");
        let b = load_from_file(&packed).expect("load bz2");
        assert!(trees_equal(&a, &b, a.root(), b.root()));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn remote_load_runs_off_loop() {
        let dir = temp_dir("remote");
        let t = sample();
        let path = dir.join("0000000000000001.xml.bz2");
        save_to_file(&t, &path, "g").expect("save");
        let loaded = load_remote(path).await.expect("load");
        assert!(trees_equal(&t, &loaded, t.root(), loaded.root()));
        let err = load_remote(dir.join("missing.xml")).await;
        assert!(err.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn serializer_skips_unhashed_files() {
        let mut t = FileTree::new();
        let f = t.create_file("nohash", 5, None, None).unwrap();
        t.add(t.root(), f).unwrap();
        let doc = serialize_filelist(&t, "g");
        assert!(!doc.contains("nohash"));
        let back = parse_filelist(doc.as_bytes()).expect("parse");
        assert!(matches!(
            back.node(back.root()).kind,
            NodeKind::Dir { size: 0, .. }
        ));
    }
}
