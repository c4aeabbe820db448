//! Owner-thread replay of tree operations.
//!
//! `TreeOpExecutor` drains batches in order, resolving each handle into a
//! real node as the creating operation is replayed. It also implements
//! [`OplessBuilder`], so synchronous parses run through the same node code.

use std::sync::Arc;

use crate::broken::{BrokenReason, BrokenState};
use crate::charset::{CharsetSource, Encoding};
use crate::dom::{DomError, Document, NodeKey};
use crate::handles::{ContentHandle, HandleError, HandleSlots, HandleTable};
use crate::speculative::SpeculativeLoad;
use crate::tree_builder::OplessBuilder;
use crate::tree_op::{ShadowRootInit, TreeOperation};
use crate::types::{Attribute, Doctype, DocumentMode, Node};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Dom(#[from] DomError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharsetComplaint {
    pub message: &'static str,
    pub error: bool,
    pub line: u32,
}

/// What one `execute` call did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecuteSummary {
    pub applied: usize,
    /// Parser-inserted scripts that became ready during this batch, in order.
    pub scripts: Vec<NodeKey>,
    pub stream_ended: bool,
    pub broken: Option<BrokenReason>,
}

#[derive(Debug)]
pub struct TreeOpExecutor {
    document: Document,
    slots: HandleSlots,
    local: HandleTable,
    local_slots: HandleSlots,
    charset: Option<(Encoding, CharsetSource)>,
    charset_complaints: Vec<CharsetComplaint>,
    encoding_menu_enabled: bool,
    stream_ended: bool,
    broken: BrokenState,
    ops_applied: u64,
}

impl TreeOpExecutor {
    pub fn new() -> Self {
        Self::with_document(Document::new())
    }

    pub fn with_document(document: Document) -> Self {
        let local = HandleTable::new();
        let local_slots = HandleSlots::bound_to(local.id());
        Self {
            document,
            slots: HandleSlots::new(),
            local,
            local_slots,
            charset: None,
            charset_complaints: Vec::new(),
            encoding_menu_enabled: false,
            stream_ended: false,
            broken: BrokenState::default(),
            ops_applied: 0,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn materialize(&self) -> Result<Node, DomError> {
        self.document.materialize()
    }

    pub fn charset(&self) -> Option<(Encoding, CharsetSource)> {
        self.charset
    }

    pub fn charset_complaints(&self) -> &[CharsetComplaint] {
        &self.charset_complaints
    }

    pub fn encoding_menu_enabled(&self) -> bool {
        self.encoding_menu_enabled
    }

    pub fn stream_ended(&self) -> bool {
        self.stream_ended
    }

    pub fn broken(&self) -> Option<BrokenReason> {
        self.broken.reason()
    }

    pub fn ops_applied(&self) -> u64 {
        self.ops_applied
    }

    /// Wraps an existing node (e.g. a fragment-parsing context) in a handle.
    pub fn handle_for_node(&mut self, node: NodeKey) -> Result<ContentHandle, ExecutorError> {
        let handle = self.local.allocate();
        self.local_slots.resolve(handle, node)?;
        Ok(handle)
    }

    /// Real node behind `handle`, if its creating operation has been replayed.
    pub fn node_for(&self, handle: ContentHandle) -> Result<NodeKey, ExecutorError> {
        if handle.table() == self.local.id() {
            Ok(self.local_slots.get(handle)?)
        } else {
            Ok(self.slots.get(handle)?)
        }
    }

    fn bind(&mut self, handle: ContentHandle, node: NodeKey) -> Result<(), ExecutorError> {
        if handle.table() == self.local.id() {
            self.local_slots.resolve(handle, node)?;
        } else {
            self.slots.resolve(handle, node)?;
        }
        Ok(())
    }

    /// Releases replay handles in bulk once a parse session is over.
    pub fn release_handles(&mut self) {
        self.slots.release();
    }

    /// Replays a batch in order. Stops at the first failing operation.
    pub fn execute(&mut self, ops: Vec<TreeOperation>) -> Result<ExecuteSummary, ExecutorError> {
        let mut summary = ExecuteSummary::default();
        log::trace!(target: "html.executor", "replaying {} ops", ops.len());
        for op in ops {
            if let Err(err) = self.apply(op, &mut summary) {
                log::warn!(target: "html.executor", "replay failed after {} ops: {err}", summary.applied);
                return Err(err);
            }
            summary.applied += 1;
            self.ops_applied += 1;
        }
        summary.stream_ended = self.stream_ended;
        summary.broken = self.broken.reason();
        Ok(summary)
    }

    fn apply(&mut self, op: TreeOperation, summary: &mut ExecuteSummary) -> Result<(), ExecutorError> {
        match op {
            TreeOperation::CreateElement {
                handle,
                name,
                attributes,
                ..
            } => {
                let node = self.document.create_element(name, attributes);
                self.bind(handle, node)?;
            }
            TreeOperation::CreateText { handle, text } => {
                let node = self.document.create_text(text);
                self.bind(handle, node)?;
            }
            TreeOperation::CreateComment { handle, text } => {
                let node = self.document.create_comment(text);
                self.bind(handle, node)?;
            }
            TreeOperation::AppendChild { parent, child } => {
                self.append_child_node(parent, child)?;
            }
            TreeOperation::AppendText { parent, text } => {
                let parent = self.node_for(parent)?;
                self.document.append_text(parent, &text)?;
            }
            TreeOperation::AppendToDocument { child } => {
                let child = self.node_for(child)?;
                self.document.append_child(NodeKey::DOCUMENT, child)?;
            }
            TreeOperation::AppendCommentToDocument { text } => {
                let node = self.document.create_comment(text);
                self.document.append_child(NodeKey::DOCUMENT, node)?;
            }
            TreeOperation::AppendDoctypeToDocument {
                name,
                public_id,
                system_id,
            } => {
                self.document.set_doctype(Doctype {
                    name,
                    public_id,
                    system_id,
                });
            }
            TreeOperation::InsertBefore {
                parent,
                child,
                before,
            } => {
                let (parent, child, before) =
                    (self.node_for(parent)?, self.node_for(child)?, self.node_for(before)?);
                self.document.insert_before(parent, child, before)?;
            }
            TreeOperation::RemoveFromParent { node } => {
                let node = self.node_for(node)?;
                self.document.detach(node)?;
            }
            TreeOperation::AppendChildrenToNewParent {
                old_parent,
                new_parent,
            } => {
                let (old_parent, new_parent) = (self.node_for(old_parent)?, self.node_for(new_parent)?);
                self.document
                    .append_children_to_new_parent(old_parent, new_parent)?;
            }
            TreeOperation::AddAttributes {
                element,
                attributes,
            } => {
                let element = self.node_for(element)?;
                self.document.add_attributes_if_missing(element, &attributes)?;
            }
            TreeOperation::GetDocumentFragmentForTemplate { template, fragment } => {
                let template = self.node_for(template)?;
                let contents = self.document.template_contents(template)?;
                self.bind(fragment, contents)?;
            }
            TreeOperation::SetDocumentFragmentForTemplate { template, fragment } => {
                let (template, fragment) = (self.node_for(template)?, self.node_for(fragment)?);
                self.document.set_template_contents(template, fragment)?;
            }
            TreeOperation::GetShadowRootFromHost {
                host,
                template,
                fragment,
                init,
            } => {
                let root = self.shadow_root_node(host, template, init)?;
                self.bind(fragment, root)?;
            }
            TreeOperation::SetFormElement { element, form } => {
                let (element, form) = (self.node_for(element)?, self.node_for(form)?);
                self.document.set_form_owner(element, form)?;
            }
            TreeOperation::RunScript { script, line } => {
                let script = self.node_for(script)?;
                if !self.document.mark_script_started(script)? {
                    log::trace!(target: "html.executor", "script ready at line {line}");
                    summary.scripts.push(script);
                }
            }
            TreeOperation::MarkScriptAlreadyStarted { script } => {
                let script = self.node_for(script)?;
                self.document.mark_script_started(script)?;
            }
            TreeOperation::UpdateCharsetSource { source } => {
                if let Some((_, current)) = &mut self.charset {
                    *current = source;
                }
            }
            TreeOperation::MaybeComplainAboutCharset {
                message,
                error,
                line,
            } => {
                log::info!(target: "html.executor", "charset: {message} (line {line})");
                self.charset_complaints.push(CharsetComplaint {
                    message,
                    error,
                    line,
                });
            }
            TreeOperation::EnableEncodingMenu => self.encoding_menu_enabled = true,
            TreeOperation::SetDocumentCharset { encoding, source } => {
                self.charset = Some((encoding, source))
            }
            TreeOperation::SetDocumentMode { mode } => self.document.set_mode(mode),
            TreeOperation::StreamEnded => self.stream_ended = true,
            TreeOperation::MarkAsBroken { reason } => {
                if self.broken.mark(reason) {
                    log::warn!(target: "html.executor", "parser reported broken: {reason}");
                }
            }
        }
        Ok(())
    }

    fn append_child_node(
        &mut self,
        parent: ContentHandle,
        child: ContentHandle,
    ) -> Result<(), ExecutorError> {
        let (parent, child) = (self.node_for(parent)?, self.node_for(child)?);
        self.document.append_child(parent, child)?;
        Ok(())
    }

    fn shadow_root_node(
        &mut self,
        host: ContentHandle,
        template: ContentHandle,
        init: ShadowRootInit,
    ) -> Result<NodeKey, ExecutorError> {
        let (host, template) = (self.node_for(host)?, self.node_for(template)?);
        match self.document.attach_shadow_root(host, init) {
            Ok(root) => Ok(root),
            Err(DomError::ShadowRootExists(_) | DomError::WrongNodeKind(_)) => {
                // The template then behaves like an ordinary one.
                log::debug!(target: "html.executor", "declarative shadow root refused on {host:?}");
                Ok(self.document.template_contents(template)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Consumes control entries of the speculative-load stream.
    pub fn apply_control(&mut self, load: &SpeculativeLoad) {
        match load {
            SpeculativeLoad::SetDocumentCharset {
                encoding, source, ..
            } => self.charset = Some((*encoding, *source)),
            SpeculativeLoad::SetDocumentMode(mode) => self.document.set_mode(*mode),
            SpeculativeLoad::Fetch(_)
            | SpeculativeLoad::SetBaseUrl(_)
            | SpeculativeLoad::SetReferrerPolicy(_) => {}
        }
    }
}

impl Default for TreeOpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl OplessBuilder for TreeOpExecutor {
    fn create_element(
        &mut self,
        name: Arc<str>,
        attributes: Vec<Attribute>,
        _line: u32,
    ) -> ContentHandle {
        let node = self.document.create_element(name, attributes);
        self.adopt_local(node)
    }

    fn create_text(&mut self, text: String) -> ContentHandle {
        let node = self.document.create_text(text);
        self.adopt_local(node)
    }

    fn create_comment(&mut self, text: String) -> ContentHandle {
        let node = self.document.create_comment(text);
        self.adopt_local(node)
    }

    fn append_child(
        &mut self,
        parent: ContentHandle,
        child: ContentHandle,
    ) -> Result<(), ExecutorError> {
        self.append_child_node(parent, child)
    }

    fn append_text(&mut self, parent: ContentHandle, text: &str) -> Result<(), ExecutorError> {
        let parent = self.node_for(parent)?;
        Ok(self.document.append_text(parent, text)?)
    }

    fn append_to_document(&mut self, child: ContentHandle) -> Result<(), ExecutorError> {
        let child = self.node_for(child)?;
        Ok(self.document.append_child(NodeKey::DOCUMENT, child)?)
    }

    fn append_comment_to_document(&mut self, text: String) -> Result<(), ExecutorError> {
        let node = self.document.create_comment(text);
        Ok(self.document.append_child(NodeKey::DOCUMENT, node)?)
    }

    fn append_doctype_to_document(&mut self, doctype: Doctype) -> Result<(), ExecutorError> {
        self.document.set_doctype(doctype);
        Ok(())
    }

    fn insert_before(
        &mut self,
        parent: ContentHandle,
        child: ContentHandle,
        before: ContentHandle,
    ) -> Result<(), ExecutorError> {
        let (parent, child, before) =
            (self.node_for(parent)?, self.node_for(child)?, self.node_for(before)?);
        Ok(self.document.insert_before(parent, child, before)?)
    }

    fn remove_from_parent(&mut self, node: ContentHandle) -> Result<(), ExecutorError> {
        let node = self.node_for(node)?;
        Ok(self.document.detach(node)?)
    }

    fn append_children_to_new_parent(
        &mut self,
        old_parent: ContentHandle,
        new_parent: ContentHandle,
    ) -> Result<(), ExecutorError> {
        let (old_parent, new_parent) = (self.node_for(old_parent)?, self.node_for(new_parent)?);
        Ok(self
            .document
            .append_children_to_new_parent(old_parent, new_parent)?)
    }

    fn add_attributes(
        &mut self,
        element: ContentHandle,
        attributes: &[Attribute],
    ) -> Result<(), ExecutorError> {
        let element = self.node_for(element)?;
        Ok(self.document.add_attributes_if_missing(element, attributes)?)
    }

    fn document_fragment_for_template(
        &mut self,
        template: ContentHandle,
    ) -> Result<ContentHandle, ExecutorError> {
        let template = self.node_for(template)?;
        let contents = self.document.template_contents(template)?;
        Ok(self.adopt_local(contents))
    }

    fn set_document_fragment_for_template(
        &mut self,
        template: ContentHandle,
        fragment: ContentHandle,
    ) -> Result<(), ExecutorError> {
        let (template, fragment) = (self.node_for(template)?, self.node_for(fragment)?);
        Ok(self.document.set_template_contents(template, fragment)?)
    }

    fn shadow_root_from_host(
        &mut self,
        host: ContentHandle,
        template: ContentHandle,
        init: ShadowRootInit,
    ) -> Result<ContentHandle, ExecutorError> {
        let root = self.shadow_root_node(host, template, init)?;
        Ok(self.adopt_local(root))
    }

    fn form_pointer_for_context(&mut self, context: ContentHandle) -> Option<ContentHandle> {
        let context = self.node_for(context).ok()?;
        let form = self.document.form_ancestor(context)?;
        Some(self.adopt_local(form))
    }

    fn set_form_element(
        &mut self,
        element: ContentHandle,
        form: ContentHandle,
    ) -> Result<(), ExecutorError> {
        let (element, form) = (self.node_for(element)?, self.node_for(form)?);
        Ok(self.document.set_form_owner(element, form)?)
    }

    fn mark_script_already_started(
        &mut self,
        script: ContentHandle,
    ) -> Result<(), ExecutorError> {
        let script = self.node_for(script)?;
        self.document.mark_script_started(script)?;
        Ok(())
    }

    fn set_document_mode(&mut self, mode: DocumentMode) {
        self.document.set_mode(mode);
    }

    fn mark_as_broken(&mut self, reason: BrokenReason) {
        if self.broken.mark(reason) {
            log::warn!(target: "html.executor", "synchronous parse broken: {reason}");
        }
    }
}

impl TreeOpExecutor {
    fn adopt_local(&mut self, node: NodeKey) -> ContentHandle {
        let handle = self.local.allocate();
        // Fresh local handles are unresolved and belong to `local_slots`'s table.
        if let Err(err) = self.local_slots.resolve(handle, node) {
            debug_assert!(false, "fresh local handle failed to resolve: {err}");
        }
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(table: &mut HandleTable, name: &str) -> (ContentHandle, TreeOperation) {
        let handle = table.allocate();
        (
            handle,
            TreeOperation::CreateElement {
                handle,
                name: Arc::from(name),
                attributes: Vec::new(),
                line: 1,
            },
        )
    }

    #[test]
    fn handle_used_before_creation_is_an_error() {
        let mut table = HandleTable::new();
        let mut exec = TreeOpExecutor::new();
        let (div, create_div) = create(&mut table, "div");
        let err = exec
            .execute(vec![TreeOperation::AppendToDocument { child: div }])
            .expect_err("append before create must fail");
        assert_eq!(err, ExecutorError::Handle(HandleError::Unresolved(div)));
        exec.execute(vec![create_div, TreeOperation::AppendToDocument { child: div }])
            .expect("create then append");
    }

    #[test]
    fn duplicate_creation_is_an_error() {
        let mut table = HandleTable::new();
        let mut exec = TreeOpExecutor::new();
        let (div, create_div) = create(&mut table, "div");
        exec.execute(vec![create_div.clone()]).expect("create");
        let err = exec.execute(vec![create_div]).expect_err("second create");
        assert_eq!(err, ExecutorError::Handle(HandleError::AlreadyResolved(div)));
    }

    #[test]
    fn run_script_reports_ready_scripts_once() {
        let mut table = HandleTable::new();
        let mut exec = TreeOpExecutor::new();
        let (script, create_script) = create(&mut table, "script");
        let summary = exec
            .execute(vec![
                create_script,
                TreeOperation::RunScript { script, line: 3 },
                TreeOperation::RunScript { script, line: 3 },
            ])
            .expect("execute");
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.scripts.len(), 1);
    }

    #[test]
    fn shadow_root_falls_back_to_template_contents() {
        let mut table = HandleTable::new();
        let mut exec = TreeOpExecutor::new();
        let (host, create_host) = create(&mut table, "div");
        let (t1, create_t1) = create(&mut table, "template");
        let (t2, create_t2) = create(&mut table, "template");
        let (f1, f2) = (table.allocate(), table.allocate());
        let init = ShadowRootInit {
            mode: crate::tree_op::ShadowRootMode::Open,
            clonable: false,
            serializable: true,
            delegates_focus: false,
        };
        exec.execute(vec![
            create_host,
            create_t1,
            create_t2,
            TreeOperation::GetShadowRootFromHost {
                host,
                template: t1,
                fragment: f1,
                init,
            },
            TreeOperation::GetShadowRootFromHost {
                host,
                template: t2,
                fragment: f2,
                init,
            },
        ])
        .expect("execute");
        let t2_node = exec.node_for(t2).expect("t2");
        let contents = exec.document_mut().template_contents(t2_node).expect("contents");
        assert_eq!(exec.node_for(f2).expect("f2"), contents);
        assert_ne!(exec.node_for(f1).expect("f1"), contents);
    }

    #[test]
    fn control_entries_and_lifecycle_ops() {
        let mut exec = TreeOpExecutor::new();
        exec.apply_control(&SpeculativeLoad::SetDocumentCharset {
            encoding: Encoding::Windows1252,
            source: CharsetSource::Fallback,
            commit_encoding_speculation: false,
        });
        exec.apply_control(&SpeculativeLoad::SetDocumentMode(DocumentMode::Quirks));
        let summary = exec
            .execute(vec![
                TreeOperation::UpdateCharsetSource {
                    source: CharsetSource::Meta,
                },
                TreeOperation::EnableEncodingMenu,
                TreeOperation::StreamEnded,
                TreeOperation::MarkAsBroken {
                    reason: BrokenReason::OutOfMemory,
                },
            ])
            .expect("execute");
        assert!(summary.stream_ended);
        assert_eq!(summary.broken, Some(BrokenReason::OutOfMemory));
        assert_eq!(
            exec.charset(),
            Some((Encoding::Windows1252, CharsetSource::Meta))
        );
        assert!(exec.encoding_menu_enabled());
        assert_eq!(exec.document().mode(), Some(DocumentMode::Quirks));
    }

    #[test]
    fn opless_handles_resolve_immediately() {
        let mut exec = TreeOpExecutor::new();
        let form = OplessBuilder::create_element(&mut exec, Arc::from("form"), Vec::new(), 1);
        let input = OplessBuilder::create_element(&mut exec, Arc::from("input"), Vec::new(), 1);
        OplessBuilder::append_to_document(&mut exec, form).expect("append");
        OplessBuilder::append_child(&mut exec, form, input).expect("append");
        let pointer = exec.form_pointer_for_context(input).expect("form ancestor");
        assert_eq!(
            exec.node_for(pointer).expect("pointer"),
            exec.node_for(form).expect("form")
        );
    }
}
