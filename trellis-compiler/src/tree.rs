use crate::placeholder;

/// Elements that never have children or a closing tag.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements whose body is kept as raw text (no markup, no interpolation).
pub const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

pub fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.iter().any(|t| t.eq_ignore_ascii_case(tag))
}

pub fn is_raw_text(tag: &str) -> bool {
    RAW_TEXT_ELEMENTS.iter().any(|t| t.eq_ignore_ascii_case(tag))
}

/// 1-based line and column of a node in its template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>, // None for `<input disabled>`
    pub span: Span,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
            span: Span::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<Attribute>,
    pub children: Vec<Node>,
    pub self_closing: bool,
    pub span: Span,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
            self_closing: false,
            span: Span::default(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn attr_value(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(|a| a.value.as_deref())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn take_attr(&mut self, name: &str) -> Option<Attribute> {
        let index = self.attrs.iter().position(|a| a.name == name)?;
        Some(self.attrs.remove(index))
    }

    /// Replace an attribute in place, or append it.
    pub fn set_attr(&mut self, name: &str, value: Option<String>) {
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attrs.push(Attribute::new(name, value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    Doctype(String),
    /// A subtree the directive pass already expanded; it is serialized
    /// as-is and never processed twice.
    Compiled(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub children: Vec<Node>,
}

impl Document {
    pub fn serialize(&self) -> String {
        serialize_nodes(&self.children)
    }
}

pub fn serialize_nodes(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        write_node(node, &mut out);
    }
    out
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(text),
        Node::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
        Node::Doctype(text) => {
            out.push_str("<!");
            out.push_str(text);
            out.push('>');
        }
        Node::Compiled(nodes) => nodes.iter().for_each(|n| write_node(n, out)),
        Node::Element(el) => write_element(el, out),
    }
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.tag);
    for attr in &el.attrs {
        // marker attributes carry their own leading space in the code they stand for
        if placeholder::is_token(&attr.name) {
            out.push_str(&attr.name);
            continue;
        }
        out.push(' ');
        out.push_str(&attr.name);
        if let Some(value) = &attr.value {
            out.push_str("=\"");
            out.push_str(&value.replace('"', "&quot;"));
            out.push('"');
        }
    }
    if is_void(&el.tag) {
        out.push('>');
        return;
    }
    if el.self_closing && el.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &el.children {
        write_node(child, out);
    }
    out.push_str("</");
    out.push_str(&el.tag);
    out.push('>');
}

/// Depth-first search for the first element matching `pred`, not descending
/// into a match.
pub fn find_element<'a>(nodes: &'a [Node], pred: &dyn Fn(&Element) -> bool) -> Option<&'a Element> {
    for node in nodes {
        let found = match node {
            Node::Element(el) if pred(el) => Some(el),
            Node::Element(el) => find_element(&el.children, pred),
            Node::Compiled(inner) => find_element(inner, pred),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    None
}
