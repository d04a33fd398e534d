use crate::error::ParseError;
use crate::placeholder;
use crate::tree::{Attribute, Document, Element, Node, Span, is_raw_text, is_void};

/// Turns template source into an element tree.
///
/// Implementations must reject malformed markup rather than guess, and must
/// keep attribute order and text verbatim so the tree serializes back to the
/// same markup.
pub trait TreeBuilder: Send + Sync {
    fn parse(&self, source: &str) -> Result<Document, ParseError>;
}

/// The built-in strict markup parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkupParser;

impl TreeBuilder for MarkupParser {
    fn parse(&self, source: &str) -> Result<Document, ParseError> {
        parse_document(source)
    }
}

/// Hand-rolled HTML-ish parser with support for:
/// - nested elements, void elements and self-closing tags (`<br/>`)
/// - quoted, unquoted and valueless attributes, in source order
/// - comments, doctypes and raw-text `script`/`style` bodies
///
/// Unclosed or mismatched tags are errors.
pub fn parse_document(input: &str) -> Result<Document, ParseError> {
    let mut p = Cursor::new(input);
    if let Some(at) = input.find([placeholder::OPEN, placeholder::CLOSE]) {
        p.advance_to(at);
        return Err(p.error("reserved private-use character in template"));
    }

    let mut stack: Vec<Element> = Vec::new();
    let mut roots: Vec<Node> = Vec::new();

    fn push_child(stack: &mut [Element], roots: &mut Vec<Node>, node: Node) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    while !p.eof() {
        if p.starts_with("<!--") {
            let span = p.span();
            p.advance(4);
            let Some(len) = p.rest().find("-->") else {
                return Err(ParseError::at(span, "unterminated comment"));
            };
            let text = p.take(len).to_string();
            p.advance(3);
            push_child(&mut stack, &mut roots, Node::Comment(text));
        } else if p.starts_with("<!") {
            let span = p.span();
            p.advance(2);
            let Some(len) = p.rest().find('>') else {
                return Err(ParseError::at(span, "unterminated doctype"));
            };
            let text = p.take(len).to_string();
            p.advance(1);
            push_child(&mut stack, &mut roots, Node::Doctype(text));
        } else if p.starts_with("</") {
            let span = p.span();
            p.advance(2);
            let tag = p.read_name(is_tag_char);
            p.skip_ws();
            if !p.eat('>') {
                return Err(p.error(format!("expected `>` to close `</{tag}`")));
            }
            let Some(open) = stack.pop() else {
                return Err(ParseError::at(span, format!("unexpected closing tag `</{tag}>`")));
            };
            if !open.tag.eq_ignore_ascii_case(&tag) {
                return Err(ParseError::at(
                    span,
                    format!(
                        "`</{tag}>` does not match `<{}>` opened at {}:{}",
                        open.tag, open.span.line, open.span.column
                    ),
                ));
            }
            push_child(&mut stack, &mut roots, Node::Element(open));
        } else if p.starts_with("<") && p.peek_at(1).is_some_and(|c| c.is_ascii_alphabetic()) {
            let mut el = open_tag(&mut p)?;
            if el.self_closing || is_void(&el.tag) {
                push_child(&mut stack, &mut roots, Node::Element(el));
            } else if is_raw_text(&el.tag) {
                let close = format!("</{}", el.tag.to_ascii_lowercase());
                let Some(len) = p.rest().to_ascii_lowercase().find(&close) else {
                    return Err(ParseError::at(el.span, format!("unclosed `<{}>`", el.tag)));
                };
                let body = p.take(len).to_string();
                if !body.is_empty() {
                    el.children.push(Node::Text(body));
                }
                p.advance(close.len());
                p.skip_ws();
                if !p.eat('>') {
                    return Err(p.error(format!("expected `>` to close `</{}`", el.tag)));
                }
                push_child(&mut stack, &mut roots, Node::Element(el));
            } else {
                stack.push(el);
            }
        } else {
            // text until the next tag-like `<`
            let start = p.pos;
            p.advance(p.rest().chars().next().map_or(1, char::len_utf8));
            while !p.eof() && !starts_markup(p.rest()) {
                p.advance(p.rest().chars().next().map_or(1, char::len_utf8));
            }
            let text = input[start..p.pos].to_string();
            push_child(&mut stack, &mut roots, Node::Text(text));
        }
    }

    if let Some(open) = stack.pop() {
        return Err(ParseError::at(open.span, format!("unclosed `<{}>`", open.tag)));
    }
    Ok(Document { children: roots })
}

fn starts_markup(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some('<')
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!')
}

fn open_tag(p: &mut Cursor) -> Result<Element, ParseError> {
    let span = p.span();
    p.advance(1);
    let mut el = Element::new(p.read_name(is_tag_char));
    el.span = span;

    loop {
        let had_space = p.skip_ws();
        if p.eof() {
            return Err(ParseError::at(span, format!("unterminated tag `<{}`", el.tag)));
        }
        if p.eat('>') {
            break;
        }
        if p.starts_with("/>") {
            p.advance(2);
            el.self_closing = true;
            break;
        }
        if !had_space {
            return Err(p.error(format!("expected whitespace between attributes of `<{}>`", el.tag)));
        }
        let attr = read_attribute(p)?;
        if el.has_attr(&attr.name) {
            return Err(ParseError::at(attr.span, format!("duplicate attribute `{}`", attr.name)));
        }
        el.attrs.push(attr);
    }
    Ok(el)
}

fn read_attribute(p: &mut Cursor) -> Result<Attribute, ParseError> {
    let span = p.span();
    let name = p.read_name(is_attr_char);
    if name.is_empty() {
        let found = p.rest().chars().next().unwrap_or(' ');
        return Err(p.error(format!("unexpected `{found}` in tag")));
    }

    let save = p.clone();
    p.skip_ws();
    if !p.eat('=') {
        *p = save;
        return Ok(Attribute {
            name,
            value: None,
            span,
        });
    }
    p.skip_ws();

    let value = match p.rest().chars().next() {
        Some(q @ ('"' | '\'')) => {
            let open = p.span();
            p.advance(1);
            let Some(len) = p.rest().find(q) else {
                return Err(ParseError::at(open, format!("unterminated value for `{name}`")));
            };
            let value = p.take(len).to_string();
            p.advance(1);
            value
        }
        _ => {
            let value = p.read_name(|c| !c.is_whitespace() && !matches!(c, '>' | '"' | '\'' | '=' | '<' | '`'));
            if value.is_empty() {
                return Err(p.error(format!("missing value for `{name}`")));
            }
            value
        }
    };
    Ok(Attribute {
        name,
        value: Some(value),
        span,
    })
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == ':' || c == '_'
}

fn is_attr_char(c: char) -> bool {
    !c.is_whitespace() && !c.is_control() && !matches!(c, '"' | '\'' | '>' | '/' | '=' | '<')
}

impl ParseError {
    fn at(span: Span, message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
            line: span.line,
            column: span.column,
        }
    }
}

#[derive(Clone)]
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    line_start: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Cursor {
            src,
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    fn eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn starts_with(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            column: self.src[self.line_start..self.pos].chars().count() + 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::at(self.span(), message)
    }

    /// Move forward `n` bytes, keeping line bookkeeping. `n` must land on a
    /// char boundary.
    fn advance(&mut self, n: usize) {
        let end = (self.pos + n).min(self.src.len());
        for (i, b) in self.src.as_bytes()[self.pos..end].iter().enumerate() {
            if *b == b'\n' {
                self.line += 1;
                self.line_start = self.pos + i + 1;
            }
        }
        self.pos = end;
    }

    fn advance_to(&mut self, at: usize) {
        self.advance(at.saturating_sub(self.pos));
    }

    fn take(&mut self, n: usize) -> &'a str {
        let s = &self.src[self.pos..self.pos + n];
        self.advance(n);
        s
    }

    fn eat(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.advance(c.len_utf8());
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) -> bool {
        let len = self.rest().len() - self.rest().trim_start().len();
        self.advance(len);
        len > 0
    }

    fn read_name(&mut self, accept: impl Fn(char) -> bool) -> String {
        let len = self
            .rest()
            .char_indices()
            .find(|&(_, c)| !accept(c))
            .map_or(self.rest().len(), |(i, _)| i);
        self.take(len).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_with_spans() {
        let doc = parse_document("<ul>\n  <li class=\"a\">one</li>\n</ul>").unwrap();
        let Node::Element(ul) = &doc.children[0] else {
            panic!("expected element");
        };
        let li = ul
            .children
            .iter()
            .find_map(|n| match n {
                Node::Element(e) => Some(e),
                _ => None,
            })
            .unwrap();
        assert_eq!(li.attr_value("class"), Some("a"));
        assert_eq!(li.span, Span { line: 2, column: 3 });
    }

    #[test]
    fn round_trips_markup() {
        let src = "<!DOCTYPE html><div id=x data-v='1' hidden><br><img src=\"a.png\"/><!-- c --><p>a &amp; b</p></div>";
        let doc = parse_document(src).unwrap();
        assert_eq!(
            doc.serialize(),
            "<!DOCTYPE html><div id=\"x\" data-v=\"1\" hidden><br><img src=\"a.png\"><!-- c --><p>a &amp; b</p></div>"
        );
    }

    #[test]
    fn directive_names_survive() {
        let doc = parse_document(r#"<li directive:repeat="item items" @click="go">x</li>"#).unwrap();
        let Node::Element(li) = &doc.children[0] else {
            panic!("expected element");
        };
        let names: Vec<_> = li.attrs.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["directive:repeat", "@click"]);
    }

    #[test]
    fn script_body_is_raw() {
        let doc = parse_document("<script>if (a < b) { x(\"</p>\"); }</script>").unwrap();
        let Node::Element(script) = &doc.children[0] else {
            panic!("expected element");
        };
        assert_eq!(
            script.children,
            vec![Node::Text("if (a < b) { x(\"</p>\"); }".into())]
        );
    }

    #[test]
    fn text_keeps_lone_angle_brackets() {
        let doc = parse_document("<p>1 < 2</p>").unwrap();
        assert_eq!(doc.serialize(), "<p>1 < 2</p>");
    }

    #[test]
    fn rejects_malformed_markup() {
        let unclosed = parse_document("<div><p>hi</div>").unwrap_err();
        assert!(unclosed.message.contains("does not match"), "{unclosed}");

        let open = parse_document("<section>\n<div>").unwrap_err();
        assert_eq!((open.line, open.column), (2, 1));

        assert!(parse_document("</p>").is_err());
        assert!(parse_document("<a href=\"x>t</a>").is_err());
        assert!(parse_document("<a b=1 b=2></a>").is_err());
        assert!(parse_document("<p>\u{E000}0\u{E001}</p>").is_err());
    }
}
