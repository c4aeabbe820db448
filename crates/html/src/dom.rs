//! Owner-thread document arena.
//!
//! The real node store the executor writes into. Nodes are addressed by
//! `NodeKey`, allocated sequentially starting at 1; the document node is
//! always key 1. Keys are never reused within a document.
//!
//! Invariants:
//! - A node has at most one parent; appending a node that already has a
//!   parent moves it.
//! - Operations never create cycles.
//! - Only document, fragment and element nodes have children.

use std::sync::Arc;

use crate::tree_op::ShadowRootInit;
use crate::types::{Attribute, Doctype, DocumentMode, Id, Node};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub u32);

impl NodeKey {
    pub const DOCUMENT: NodeKey = NodeKey(1);

    fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DomError {
    #[error("node {0:?} does not exist")]
    MissingNode(NodeKey),
    #[error("node {0:?} cannot have children")]
    InvalidParent(NodeKey),
    #[error("node {0:?} has the wrong kind for this operation")]
    WrongNodeKind(NodeKey),
    #[error("{before:?} is not a child of {parent:?}")]
    InvalidSibling { parent: NodeKey, before: NodeKey },
    #[error("inserting {child:?} under {parent:?} would create a cycle")]
    CycleDetected { parent: NodeKey, child: NodeKey },
    #[error("host {0:?} already has a shadow root")]
    ShadowRootExists(NodeKey),
}

#[derive(Debug)]
enum NodeKind {
    Document,
    Fragment,
    Element {
        name: Arc<str>,
        attributes: Vec<Attribute>,
        template_contents: Option<NodeKey>,
        shadow_root: Option<NodeKey>,
        shadow_init: Option<ShadowRootInit>,
        form_owner: Option<NodeKey>,
        already_started: bool,
    },
    Text(String),
    Comment(String),
}

#[derive(Debug)]
struct NodeRecord {
    kind: NodeKind,
    parent: Option<NodeKey>,
    children: Vec<NodeKey>,
}

impl NodeRecord {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
        }
    }

    fn allows_children(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Document | NodeKind::Fragment | NodeKind::Element { .. }
        )
    }
}

#[derive(Debug)]
pub struct Document {
    nodes: Vec<NodeRecord>,
    doctype: Option<Doctype>,
    mode: Option<DocumentMode>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeRecord::new(NodeKind::Document)],
            doctype: None,
            mode: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[0].children.is_empty()
    }

    pub fn mode(&self) -> Option<DocumentMode> {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DocumentMode) {
        self.mode = Some(mode);
    }

    pub fn set_doctype(&mut self, doctype: Doctype) {
        self.doctype = Some(doctype);
    }

    fn push(&mut self, kind: NodeKind) -> NodeKey {
        self.nodes.push(NodeRecord::new(kind));
        // The arena starts with the document node, so len() >= 1.
        NodeKey(self.nodes.len() as u32)
    }

    fn record(&self, key: NodeKey) -> Result<&NodeRecord, DomError> {
        if key.0 == 0 {
            return Err(DomError::MissingNode(key));
        }
        self.nodes.get(key.index()).ok_or(DomError::MissingNode(key))
    }

    fn record_mut(&mut self, key: NodeKey) -> Result<&mut NodeRecord, DomError> {
        if key.0 == 0 {
            return Err(DomError::MissingNode(key));
        }
        self.nodes
            .get_mut(key.index())
            .ok_or(DomError::MissingNode(key))
    }

    pub fn create_element(&mut self, name: Arc<str>, attributes: Vec<Attribute>) -> NodeKey {
        self.push(NodeKind::Element {
            name,
            attributes,
            template_contents: None,
            shadow_root: None,
            shadow_init: None,
            form_owner: None,
            already_started: false,
        })
    }

    pub fn create_text(&mut self, text: String) -> NodeKey {
        self.push(NodeKind::Text(text))
    }

    pub fn create_comment(&mut self, text: String) -> NodeKey {
        self.push(NodeKind::Comment(text))
    }

    pub fn create_fragment(&mut self) -> NodeKey {
        self.push(NodeKind::Fragment)
    }

    pub fn parent(&self, key: NodeKey) -> Result<Option<NodeKey>, DomError> {
        Ok(self.record(key)?.parent)
    }

    pub fn children(&self, key: NodeKey) -> Result<&[NodeKey], DomError> {
        Ok(&self.record(key)?.children)
    }

    pub fn element_name(&self, key: NodeKey) -> Option<&str> {
        match &self.record(key).ok()?.kind {
            NodeKind::Element { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn text(&self, key: NodeKey) -> Option<&str> {
        match &self.record(key).ok()?.kind {
            NodeKind::Text(text) => Some(text),
            _ => None,
        }
    }

    fn check_insert(&self, parent: NodeKey, child: NodeKey) -> Result<(), DomError> {
        if !self.record(parent)?.allows_children() {
            return Err(DomError::InvalidParent(parent));
        }
        self.record(child)?;
        if child == NodeKey::DOCUMENT || parent == child || self.is_ancestor(child, parent) {
            return Err(DomError::CycleDetected { parent, child });
        }
        Ok(())
    }

    fn is_ancestor(&self, ancestor: NodeKey, node: NodeKey) -> bool {
        let mut current = self.record(node).ok().and_then(|r| r.parent);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = self.record(key).ok().and_then(|r| r.parent);
        }
        false
    }

    pub fn append_child(&mut self, parent: NodeKey, child: NodeKey) -> Result<(), DomError> {
        self.check_insert(parent, child)?;
        self.detach(child)?;
        self.record_mut(parent)?.children.push(child);
        self.record_mut(child)?.parent = Some(parent);
        Ok(())
    }

    pub fn insert_before(
        &mut self,
        parent: NodeKey,
        child: NodeKey,
        before: NodeKey,
    ) -> Result<(), DomError> {
        self.check_insert(parent, child)?;
        if self.record(before)?.parent != Some(parent) || before == child {
            return Err(DomError::InvalidSibling { parent, before });
        }
        self.detach(child)?;
        let siblings = &mut self.record_mut(parent)?.children;
        let pos = siblings
            .iter()
            .position(|k| *k == before)
            .ok_or(DomError::InvalidSibling { parent, before })?;
        siblings.insert(pos, child);
        self.record_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Appends text, extending a trailing text child instead of creating a new node.
    pub fn append_text(&mut self, parent: NodeKey, text: &str) -> Result<(), DomError> {
        let record = self.record(parent)?;
        if !record.allows_children() {
            return Err(DomError::InvalidParent(parent));
        }
        if let Some(&last) = record.children.last() {
            if let NodeKind::Text(existing) = &mut self.record_mut(last)?.kind {
                existing.push_str(text);
                return Ok(());
            }
        }
        let node = self.create_text(text.to_string());
        self.append_child(parent, node)
    }

    pub fn detach(&mut self, node: NodeKey) -> Result<(), DomError> {
        let Some(parent) = self.record_mut(node)?.parent.take() else {
            return Ok(());
        };
        self.record_mut(parent)?.children.retain(|k| *k != node);
        Ok(())
    }

    pub fn append_children_to_new_parent(
        &mut self,
        old_parent: NodeKey,
        new_parent: NodeKey,
    ) -> Result<(), DomError> {
        if old_parent == new_parent {
            return Ok(());
        }
        let children = std::mem::take(&mut self.record_mut(old_parent)?.children);
        for child in &children {
            self.record_mut(*child)?.parent = None;
        }
        for child in children {
            self.append_child(new_parent, child)?;
        }
        Ok(())
    }

    /// Adds attributes whose names the element does not carry yet.
    pub fn add_attributes_if_missing(
        &mut self,
        element: NodeKey,
        extra: &[Attribute],
    ) -> Result<(), DomError> {
        match &mut self.record_mut(element)?.kind {
            NodeKind::Element { attributes, .. } => {
                for attr in extra {
                    if !attributes.iter().any(|a| a.name == attr.name) {
                        attributes.push(attr.clone());
                    }
                }
                Ok(())
            }
            _ => Err(DomError::WrongNodeKind(element)),
        }
    }

    /// Content fragment of a template element, created on first access.
    pub fn template_contents(&mut self, template: NodeKey) -> Result<NodeKey, DomError> {
        match &self.record(template)?.kind {
            NodeKind::Element {
                template_contents: Some(contents),
                ..
            } => return Ok(*contents),
            NodeKind::Element { .. } => {}
            _ => return Err(DomError::WrongNodeKind(template)),
        }
        let fragment = self.create_fragment();
        self.set_template_contents(template, fragment)?;
        Ok(fragment)
    }

    pub fn set_template_contents(
        &mut self,
        template: NodeKey,
        fragment: NodeKey,
    ) -> Result<(), DomError> {
        if !matches!(self.record(fragment)?.kind, NodeKind::Fragment) {
            return Err(DomError::WrongNodeKind(fragment));
        }
        match &mut self.record_mut(template)?.kind {
            NodeKind::Element {
                template_contents, ..
            } => {
                *template_contents = Some(fragment);
                Ok(())
            }
            _ => Err(DomError::WrongNodeKind(template)),
        }
    }

    pub fn attach_shadow_root(
        &mut self,
        host: NodeKey,
        init: ShadowRootInit,
    ) -> Result<NodeKey, DomError> {
        match &self.record(host)?.kind {
            NodeKind::Element {
                shadow_root: Some(_),
                ..
            } => return Err(DomError::ShadowRootExists(host)),
            NodeKind::Element { .. } => {}
            _ => return Err(DomError::WrongNodeKind(host)),
        }
        let root = self.create_fragment();
        if let NodeKind::Element {
            shadow_root,
            shadow_init,
            ..
        } = &mut self.record_mut(host)?.kind
        {
            *shadow_root = Some(root);
            *shadow_init = Some(init);
        }
        Ok(root)
    }

    pub fn set_form_owner(&mut self, element: NodeKey, form: NodeKey) -> Result<(), DomError> {
        if self.element_name(form) != Some("form") {
            return Err(DomError::WrongNodeKind(form));
        }
        match &mut self.record_mut(element)?.kind {
            NodeKind::Element { form_owner, .. } => {
                *form_owner = Some(form);
                Ok(())
            }
            _ => Err(DomError::WrongNodeKind(element)),
        }
    }

    pub fn form_owner(&self, element: NodeKey) -> Option<NodeKey> {
        match &self.record(element).ok()?.kind {
            NodeKind::Element { form_owner, .. } => *form_owner,
            _ => None,
        }
    }

    /// Marks a script as already started; returns whether it was before.
    pub fn mark_script_started(&mut self, script: NodeKey) -> Result<bool, DomError> {
        match &mut self.record_mut(script)?.kind {
            NodeKind::Element {
                already_started, ..
            } => Ok(std::mem::replace(already_started, true)),
            _ => Err(DomError::WrongNodeKind(script)),
        }
    }

    pub fn is_script_started(&self, script: NodeKey) -> bool {
        matches!(
            self.record(script).map(|r| &r.kind),
            Ok(NodeKind::Element {
                already_started: true,
                ..
            })
        )
    }

    /// Nearest `form` ancestor of `node`, inclusive.
    pub fn form_ancestor(&self, node: NodeKey) -> Option<NodeKey> {
        let mut current = Some(node);
        while let Some(key) = current {
            if self.element_name(key) == Some("form") {
                return Some(key);
            }
            current = self.record(key).ok()?.parent;
        }
        None
    }

    pub fn materialize(&self) -> Result<Node, DomError> {
        self.materialize_node(NodeKey::DOCUMENT)
    }

    pub fn materialize_node(&self, key: NodeKey) -> Result<Node, DomError> {
        let record = self.record(key)?;
        let id = Id(key.0);
        let children = record
            .children
            .iter()
            .map(|child| self.materialize_node(*child))
            .collect::<Result<Vec<_>, _>>()?;
        let boxed = |key: Option<NodeKey>| -> Result<Option<Box<Node>>, DomError> {
            key.map(|k| self.materialize_node(k).map(Box::new))
                .transpose()
        };
        let node = match &record.kind {
            NodeKind::Document => Node::Document {
                id,
                doctype: self.doctype.clone(),
                mode: self.mode,
                children,
            },
            NodeKind::Fragment => Node::Fragment { id, children },
            NodeKind::Element {
                name,
                attributes,
                template_contents,
                shadow_root,
                form_owner,
                ..
            } => Node::Element {
                id,
                name: Arc::clone(name),
                attributes: attributes.clone(),
                form_owner: form_owner.map(|k| Id(k.0)),
                template_contents: boxed(*template_contents)?,
                shadow_root: boxed(*shadow_root)?,
                children,
            },
            NodeKind::Text(text) => Node::Text {
                id,
                text: text.clone(),
            },
            NodeKind::Comment(text) => Node::Comment {
                id,
                text: text.clone(),
            },
        };
        Ok(node)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(doc: &mut Document, name: &str) -> NodeKey {
        doc.create_element(Arc::from(name), Vec::new())
    }

    #[test]
    fn append_moves_existing_child() {
        let mut doc = Document::new();
        let a = element(&mut doc, "a");
        let b = element(&mut doc, "b");
        let c = element(&mut doc, "c");
        doc.append_child(a, c).expect("append");
        doc.append_child(b, c).expect("move");
        assert!(doc.children(a).expect("a").is_empty());
        assert_eq!(doc.children(b).expect("b"), &[c]);
        assert_eq!(doc.parent(c).expect("c"), Some(b));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut doc = Document::new();
        let a = element(&mut doc, "a");
        let b = element(&mut doc, "b");
        doc.append_child(a, b).expect("append");
        assert_eq!(
            doc.append_child(b, a),
            Err(DomError::CycleDetected { parent: b, child: a })
        );
        assert_eq!(
            doc.append_child(a, a),
            Err(DomError::CycleDetected { parent: a, child: a })
        );
    }

    #[test]
    fn text_coalesces_with_trailing_text() {
        let mut doc = Document::new();
        let p = element(&mut doc, "p");
        doc.append_text(p, "he").expect("text");
        doc.append_text(p, "llo").expect("text");
        let children = doc.children(p).expect("p").to_vec();
        assert_eq!(children.len(), 1);
        assert_eq!(doc.text(children[0]), Some("hello"));
        let t = doc.create_text("x".to_string());
        assert_eq!(doc.append_text(t, "y"), Err(DomError::InvalidParent(t)));
    }

    #[test]
    fn insert_before_requires_sibling() {
        let mut doc = Document::new();
        let ul = element(&mut doc, "ul");
        let first = element(&mut doc, "li");
        let second = element(&mut doc, "li");
        doc.append_child(ul, second).expect("append");
        doc.insert_before(ul, first, second).expect("insert");
        assert_eq!(doc.children(ul).expect("ul"), &[first, second]);
        let stray = element(&mut doc, "li");
        let other = element(&mut doc, "li");
        assert_eq!(
            doc.insert_before(ul, stray, other),
            Err(DomError::InvalidSibling {
                parent: ul,
                before: other
            })
        );
    }

    #[test]
    fn template_contents_created_once() {
        let mut doc = Document::new();
        let t = element(&mut doc, "template");
        let first = doc.template_contents(t).expect("contents");
        let second = doc.template_contents(t).expect("contents");
        assert_eq!(first, second);
    }

    #[test]
    fn second_shadow_root_is_refused() {
        let mut doc = Document::new();
        let host = element(&mut doc, "div");
        let init = ShadowRootInit {
            mode: crate::tree_op::ShadowRootMode::Open,
            clonable: false,
            serializable: false,
            delegates_focus: false,
        };
        doc.attach_shadow_root(host, init).expect("first");
        assert_eq!(
            doc.attach_shadow_root(host, init),
            Err(DomError::ShadowRootExists(host))
        );
    }

    #[test]
    fn add_attributes_keeps_existing_values() {
        let mut doc = Document::new();
        let body = doc.create_element(Arc::from("body"), vec![Attribute::new("class", "a")]);
        doc.add_attributes_if_missing(
            body,
            &[Attribute::new("class", "b"), Attribute::new("id", "x")],
        )
        .expect("add");
        doc.append_child(NodeKey::DOCUMENT, body).expect("append");
        let Node::Document { children, .. } = doc.materialize().expect("materialize") else {
            panic!("root must be a document");
        };
        let Node::Element { attributes, .. } = &children[0] else {
            panic!("expected element");
        };
        assert_eq!(
            attributes,
            &vec![Attribute::new("class", "a"), Attribute::new("id", "x")]
        );
    }
}
