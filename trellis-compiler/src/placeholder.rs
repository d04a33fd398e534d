//! Placeholder markers: stand-ins for generated code inside the element
//! tree.
//!
//! A processor that needs to emit code asks the codec for a marker, places the
//! marker's token in the tree (as a text node or as an attribute name), and
//! keeps working on plain markup. After serialization [`PlaceholderCodec::decode`]
//! splits the document back into markup and code.
//!
//! Tokens are `U+E000 <decimal id> U+E001`. Both sentinels are private-use
//! characters the tree builder refuses in template source, so a token can
//! never collide with real content.

use crate::error::PlaceholderError;
use crate::tree::{Attribute, Node};

pub const OPEN: char = '\u{E000}';
pub const CLOSE: char = '\u{E001}';

/// Where the code of a marker sits relative to its host element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Before,
    After,
    Content,
    Replace,
    Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub id: usize,
    pub position: Position,
}

impl Marker {
    pub fn token(&self) -> String {
        format!("{OPEN}{}{CLOSE}", self.id)
    }
}

pub fn is_token(s: &str) -> bool {
    s.strip_prefix(OPEN)
        .and_then(|s| s.strip_suffix(CLOSE))
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug)]
struct Entry {
    position: Position,
    code: String,
}

/// Issued marker count at some point, for rolling back a failed processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, PartialEq, Eq)]
pub enum Segment {
    Markup(String),
    Code(String),
}

/// Per-compilation marker table. Ids are issued sequentially, so the same
/// tree processed the same way always yields the same tokens.
#[derive(Debug, Default)]
pub struct PlaceholderCodec {
    entries: Vec<Entry>,
}

impl PlaceholderCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, position: Position, code: impl Into<String>) -> Marker {
        let mut code = code.into();
        if position != Position::Attribute && !code.ends_with('\n') {
            code.push('\n');
        }
        self.entries.push(Entry { position, code });
        Marker {
            id: self.entries.len() - 1,
            position,
        }
    }

    /// A text node standing for `code`.
    pub fn node(&mut self, position: Position, code: impl Into<String>) -> Node {
        Node::Text(self.encode(position, code).token())
    }

    /// A valueless attribute standing for `code`. The code must print its
    /// own leading space.
    pub fn attribute(&mut self, code: impl Into<String>) -> Attribute {
        Attribute::new(self.encode(Position::Attribute, code).token(), None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.entries.len())
    }

    /// Forget every marker issued since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.entries.truncate(checkpoint.0);
    }

    /// Split serialized markup into markup and code, checking that every
    /// issued marker appears exactly once.
    pub fn decode(&self, serialized: &str) -> Result<Vec<Segment>, PlaceholderError> {
        let mut seen = vec![false; self.entries.len()];
        let mut segments = Vec::new();
        let mut markup = String::new();
        let mut rest = serialized;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            markup.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len_utf8()..];
            let close = after
                .find(CLOSE)
                .ok_or(PlaceholderError::Malformed(offset + start))?;
            let id: usize = after[..close]
                .parse()
                .map_err(|_| PlaceholderError::Malformed(offset + start))?;
            let entry = self.entries.get(id).ok_or(PlaceholderError::Unknown(id))?;
            if std::mem::replace(&mut seen[id], true) {
                return Err(PlaceholderError::Duplicated(id));
            }

            if !markup.is_empty() {
                segments.push(Segment::Markup(std::mem::take(&mut markup)));
            }
            segments.push(Segment::Code(entry.code.clone()));

            let consumed = start + OPEN.len_utf8() + close + CLOSE.len_utf8();
            offset += consumed;
            rest = &rest[consumed..];
        }
        if rest.contains(CLOSE) {
            return Err(PlaceholderError::Malformed(offset + rest.find(CLOSE).unwrap_or(0)));
        }
        markup.push_str(rest);
        if !markup.is_empty() {
            segments.push(Segment::Markup(markup));
        }

        if let Some(id) = seen.iter().position(|s| !s) {
            return Err(PlaceholderError::Orphaned {
                id,
                position: self.entries[id].position,
            });
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_markup_and_code_in_order() {
        let mut codec = PlaceholderCodec::new();
        let a = codec.encode(Position::Before, "if (truthy($)) {");
        let b = codec.encode(Position::After, "}");
        let doc = format!("{}<p>x</p>{}", a.token(), b.token());
        assert_eq!(
            codec.decode(&doc).unwrap(),
            vec![
                Segment::Code("if (truthy($)) {\n".into()),
                Segment::Markup("<p>x</p>".into()),
                Segment::Code("}\n".into()),
            ]
        );
    }

    #[test]
    fn attribute_code_is_kept_inline() {
        let mut codec = PlaceholderCodec::new();
        let attr = codec.attribute(r#"print attr("id", $id);"#);
        assert!(is_token(&attr.name));
        let doc = format!("<p{}>", attr.name);
        let segments = codec.decode(&doc).unwrap();
        assert_eq!(segments[1], Segment::Code(r#"print attr("id", $id);"#.into()));
    }

    #[test]
    fn detects_lost_and_repeated_markers() {
        let mut codec = PlaceholderCodec::new();
        let a = codec.encode(Position::Content, "print 1;");
        codec.encode(Position::Content, "print 2;");
        assert_eq!(
            codec.decode(&a.token()),
            Err(PlaceholderError::Orphaned {
                id: 1,
                position: Position::Content
            })
        );
        let twice = format!("{}{}", a.token(), a.token());
        assert_eq!(codec.decode(&twice), Err(PlaceholderError::Duplicated(0)));
        assert_eq!(
            codec.decode(&format!("{OPEN}7{CLOSE}")),
            Err(PlaceholderError::Unknown(7))
        );
        assert!(matches!(
            codec.decode(&format!("{OPEN}x")),
            Err(PlaceholderError::Malformed(0))
        ));
    }

    #[test]
    fn rollback_forgets_later_markers() {
        let mut codec = PlaceholderCodec::new();
        let kept = codec.encode(Position::Content, "print 1;");
        let checkpoint = codec.checkpoint();
        codec.encode(Position::Content, "print 2;");
        codec.rollback(checkpoint);
        assert_eq!(codec.len(), 1);
        assert!(codec.decode(&kept.token()).is_ok());
    }
}
