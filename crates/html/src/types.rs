use std::sync::Arc;

pub type NodeId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub NodeId);

/// Element attribute as it travels through the operation stream.
///
/// Names are canonical ASCII-lowercase; order and duplicates are preserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: Arc<str>,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<Arc<str>>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

pub fn attribute_value<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(name))
        .map(|a| a.value.as_str())
}

/// Rendering mode decided once from the doctype.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DocumentMode {
    #[default]
    Standards,
    LimitedQuirks,
    Quirks,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Doctype {
    pub name: String,
    pub public_id: String,
    pub system_id: String,
}

/// Tokens produced by the streaming tokenizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Doctype {
        doctype: Doctype,
        force_quirks: bool,
    },
    StartTag {
        name: Arc<str>,
        attributes: Vec<Attribute>,
        self_closing: bool,
        line: u32,
    },
    EndTag {
        name: Arc<str>,
        line: u32,
    },
    Comment(String),
    Characters(String),
    Eof,
}

/// Materialized tree, used for snapshots, equality checks, and printing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Document {
        id: Id,
        doctype: Option<Doctype>,
        mode: Option<DocumentMode>,
        children: Vec<Node>,
    },
    /// Template contents and shadow roots.
    Fragment { id: Id, children: Vec<Node> },
    Element {
        id: Id,
        name: Arc<str>,
        attributes: Vec<Attribute>,
        form_owner: Option<Id>,
        template_contents: Option<Box<Node>>,
        shadow_root: Option<Box<Node>>,
        children: Vec<Node>,
    },
    Text { id: Id, text: String },
    Comment { id: Id, text: String },
}

impl Node {
    pub fn id(&self) -> Id {
        match self {
            Node::Document { id, .. }
            | Node::Fragment { id, .. }
            | Node::Element { id, .. }
            | Node::Text { id, .. }
            | Node::Comment { id, .. } => *id,
        }
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Document { children, .. }
            | Node::Fragment { children, .. }
            | Node::Element { children, .. } => children,
            Node::Text { .. } | Node::Comment { .. } => &[],
        }
    }

    pub fn element_name(&self) -> Option<&str> {
        match self {
            Node::Element { name, .. } => Some(name),
            _ => None,
        }
    }
}
