//! Tree builder facade shared by the queued and opless modes.
//!
//! The tree-construction algorithm talks to a [`TreeBuilder`] and never to
//! the DOM. In queued mode every decision becomes a [`TreeOperation`] in a
//! producer-owned buffer that `flush` hands to the sink; in opless mode the
//! same calls go straight to an [`OplessBuilder`] on the owner thread.
//!
//! Invariants:
//! - The mode is fixed at construction.
//! - Buffered character data is emitted before any other structural operation,
//!   so text never reorders around elements.
//! - Once broken, the builder does no further productive work; the only
//!   operation it still delivers is the single `MarkAsBroken`.
//! - The document mode is reported at most once.

use std::sync::Arc;

use crate::broken::{BrokenReason, BrokenState};
use crate::charset::{CharsetSource, CharsetSwitchRequest, Encoding, SourcePosition};
use crate::diagnostics::{DiagnosticsSink, LogDiagnostics, TreeDiagnostic};
use crate::executor::ExecutorError;
use crate::handles::{ContentHandle, HandleTable};
use crate::op_queue::{OpQueue, QueueError, TreeOpSink};
use crate::speculative::{LoadScanner, SpeculativeLoad, SpeculativeLoadQueue, SpeculativeLoadStage};
use crate::tree_op::{ShadowRootInit, TreeOperation};
use crate::types::{Attribute, Doctype, DocumentMode, Token};

mod opless;
mod view_source;

pub use opless::OplessBuilder;
pub use view_source::{ErrorAnnotation, Highlighter};

#[derive(Clone, Debug)]
pub struct TreeBuilderConfig {
    /// Scan created elements for subresources and queue speculative fetches.
    /// Off for consumers that never render (plain text, view source).
    pub generate_speculative_loads: bool,
    /// Hand speculative loads to the stage as soon as they are discovered
    /// instead of on the next flush.
    pub eager_speculative_loads: bool,
    /// Mark parser-inserted scripts as already started instead of running them.
    pub prevent_script_execution: bool,
    /// Buffered operations beyond this count are reported as out of memory.
    pub max_queued_ops: Option<usize>,
}

impl Default for TreeBuilderConfig {
    fn default() -> Self {
        Self {
            generate_speculative_loads: true,
            eager_speculative_loads: false,
            prevent_script_execution: false,
            max_queued_ops: None,
        }
    }
}

/// Why the pump loop should stop feeding tokens. Ordered by priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuspendReason {
    /// A parser-inserted script must run before parsing continues.
    Script,
    /// The encoding guess was wrong; the parse must restart.
    CharsetSwitch,
    /// Fatal failure; see [`TreeBuilder::is_broken`].
    Broken,
}

struct QueuedBackend {
    handles: HandleTable,
    ops: OpQueue,
    loads: SpeculativeLoadQueue,
    scanner: LoadScanner,
    op_sink: Option<Box<dyn TreeOpSink>>,
    load_stage: Option<Box<dyn SpeculativeLoadStage>>,
    charset_switch: Option<CharsetSwitchRequest>,
}

enum Backend<'a> {
    Queued(Box<QueuedBackend>),
    Opless(&'a mut dyn OplessBuilder),
}

pub struct TreeBuilder<'a> {
    config: TreeBuilderConfig,
    backend: Backend<'a>,
    pending_text: Option<(ContentHandle, String)>,
    broken: BrokenState,
    suspension: Option<SuspendReason>,
    document_mode: Option<DocumentMode>,
    diagnostics: Box<dyn DiagnosticsSink>,
    diagnostic_count: usize,
    view_source: Option<Highlighter>,
    plain_text: bool,
    stream_ended: bool,
    // Handles handed out after an opless call failed; they resolve nowhere.
    detached: HandleTable,
}

impl TreeBuilder<'static> {
    /// Builder that queues operations for replay elsewhere. Without a sink,
    /// flushed operations are dropped (useful for measuring the producer side).
    pub fn queued(
        config: TreeBuilderConfig,
        op_sink: Option<Box<dyn TreeOpSink>>,
        load_stage: Option<Box<dyn SpeculativeLoadStage>>,
    ) -> Self {
        let ops = OpQueue::with_limit(config.max_queued_ops);
        let backend = Backend::Queued(Box::new(QueuedBackend {
            handles: HandleTable::new(),
            ops,
            loads: SpeculativeLoadQueue::new(),
            scanner: LoadScanner::default(),
            op_sink,
            load_stage,
            charset_switch: None,
        }));
        Self::with_backend(config, backend)
    }
}

impl<'a> TreeBuilder<'a> {
    /// Builder that applies every decision to `builder` immediately.
    pub fn opless(config: TreeBuilderConfig, builder: &'a mut dyn OplessBuilder) -> Self {
        Self::with_backend(config, Backend::Opless(builder))
    }

    fn with_backend(config: TreeBuilderConfig, backend: Backend<'a>) -> Self {
        Self {
            config,
            backend,
            pending_text: None,
            broken: BrokenState::default(),
            suspension: None,
            document_mode: None,
            diagnostics: Box::new(LogDiagnostics),
            diagnostic_count: 0,
            view_source: None,
            plain_text: false,
            stream_ended: false,
            detached: HandleTable::new(),
        }
    }

    pub fn with_diagnostics(mut self, sink: Box<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn config(&self) -> &TreeBuilderConfig {
        &self.config
    }

    pub fn is_opless(&self) -> bool {
        matches!(self.backend, Backend::Opless(_))
    }

    pub fn is_broken(&self) -> Option<BrokenReason> {
        self.broken.reason()
    }

    pub fn is_plain_text(&self) -> bool {
        self.plain_text
    }

    pub fn is_view_source(&self) -> bool {
        self.view_source.is_some()
    }

    pub fn has_stream_ended(&self) -> bool {
        self.stream_ended
    }

    pub fn diagnostic_count(&self) -> usize {
        self.diagnostic_count
    }

    pub fn reported_document_mode(&self) -> Option<DocumentMode> {
        self.document_mode
    }

    /// Operations buffered and not yet flushed (0 in opless mode).
    pub fn pending_ops(&self) -> usize {
        match &self.backend {
            Backend::Queued(q) => q.ops.len(),
            Backend::Opless(_) => 0,
        }
    }

    pub fn pending_loads(&self) -> usize {
        match &self.backend {
            Backend::Queued(q) => q.loads.len(),
            Backend::Opless(_) => 0,
        }
    }

    /// Unflushed operations, for inspection.
    pub fn queued_ops(&self) -> &[TreeOperation] {
        match &self.backend {
            Backend::Queued(q) => q.ops.as_slice(),
            Backend::Opless(_) => &[],
        }
    }

    pub fn highlighter(&self) -> Option<&Highlighter> {
        self.view_source.as_ref()
    }

    // ---- failure plumbing ----

    fn queue_failed(&mut self, err: QueueError) {
        let reason = match err {
            QueueError::OutOfMemory { .. } => BrokenReason::OutOfMemory,
            QueueError::SinkClosed => BrokenReason::SinkClosed,
        };
        log::warn!(target: "html.tree_builder", "{err}");
        self.mark_as_broken(reason);
    }

    fn applied(&mut self, what: &'static str, result: Result<(), ExecutorError>) {
        if let Err(err) = result {
            log::warn!(target: "html.tree_builder", "{what} failed: {err}");
            self.mark_as_broken(BrokenReason::MutationFailed(what));
        }
    }

    fn queue(&mut self, op: TreeOperation) {
        if self.broken.is_broken() {
            return;
        }
        let Backend::Queued(q) = &mut self.backend else {
            return;
        };
        if let Err(err) = q.ops.push(op) {
            self.queue_failed(err);
        }
    }

    fn queue_load(&mut self, load: SpeculativeLoad) {
        if self.broken.is_broken() {
            return;
        }
        let Backend::Queued(q) = &mut self.backend else {
            return;
        };
        if q.load_stage.is_none() {
            if let Some(op) = load.control_operation() {
                self.queue(op);
            }
            return;
        }
        let result = q.loads.push(load);
        if let Err(err) = result {
            self.queue_failed(err);
        } else if self.config.eager_speculative_loads {
            self.flush_loads();
        }
    }

    /// `Ok -> Broken(reason)`. Later reasons are ignored, but suspension is
    /// requested every time.
    pub fn mark_as_broken(&mut self, reason: BrokenReason) {
        if self.broken.mark(reason) {
            log::warn!(target: "html.tree_builder", "parser broken: {reason}");
            self.pending_text = None;
            match &mut self.backend {
                Backend::Queued(q) => {
                    q.ops.clear();
                    if let Some(hl) = self.view_source.as_mut() {
                        hl.clear_ops();
                    }
                    if let Err(err) = q.ops.push_reserved(TreeOperation::MarkAsBroken { reason }) {
                        log::error!(target: "html.tree_builder", "could not queue broken marker: {err}");
                    }
                }
                Backend::Opless(builder) => builder.mark_as_broken(reason),
            }
        }
        self.request_suspension(SuspendReason::Broken);
    }

    // ---- suspension ----

    /// Records a suspension request; a higher-priority reason replaces a lower one.
    pub fn request_suspension(&mut self, reason: SuspendReason) {
        if self.suspension.is_none_or(|current| reason > current) {
            self.suspension = Some(reason);
        }
    }

    pub fn suspension(&self) -> Option<SuspendReason> {
        self.suspension
    }

    /// Consumes the pending suspension request. A broken builder keeps
    /// asking to stay suspended.
    pub fn take_suspension(&mut self) -> Option<SuspendReason> {
        let taken = self.suspension.take();
        if self.broken.is_broken() {
            self.suspension = Some(SuspendReason::Broken);
        }
        taken
    }

    // ---- characters ----

    pub fn append_characters(&mut self, parent: ContentHandle, text: &str) {
        if self.broken.is_broken() || text.is_empty() {
            return;
        }
        if let Some((pending_parent, buffer)) = self.pending_text.as_mut() {
            if *pending_parent == parent {
                if buffer.try_reserve(text.len()).is_err() {
                    self.mark_as_broken(BrokenReason::OutOfMemory);
                    return;
                }
                buffer.push_str(text);
                return;
            }
        }
        self.flush_characters();
        self.pending_text = Some((parent, text.to_string()));
    }

    fn flush_characters(&mut self) {
        let Some((parent, text)) = self.pending_text.take() else {
            return;
        };
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::AppendText { parent, text }),
            Backend::Opless(builder) => {
                let result = builder.append_text(parent, &text);
                self.applied("append_text", result);
            }
        }
    }

    // ---- node creation ----

    pub fn create_element(
        &mut self,
        name: Arc<str>,
        attributes: Vec<Attribute>,
        line: u32,
    ) -> ContentHandle {
        match &mut self.backend {
            Backend::Queued(q) => {
                let handle = q.handles.allocate();
                let loads = if self.config.generate_speculative_loads && !self.broken.is_broken() {
                    q.scanner.scan(&name, &attributes)
                } else {
                    Vec::new()
                };
                for load in loads {
                    self.queue_load(load);
                }
                self.queue(TreeOperation::CreateElement {
                    handle,
                    name,
                    attributes,
                    line,
                });
                handle
            }
            Backend::Opless(builder) => builder.create_element(name, attributes, line),
        }
    }

    pub fn create_text_node(&mut self, text: String) -> ContentHandle {
        match &mut self.backend {
            Backend::Queued(q) => {
                let handle = q.handles.allocate();
                self.queue(TreeOperation::CreateText { handle, text });
                handle
            }
            Backend::Opless(builder) => builder.create_text(text),
        }
    }

    pub fn create_comment(&mut self, text: String) -> ContentHandle {
        match &mut self.backend {
            Backend::Queued(q) => {
                let handle = q.handles.allocate();
                self.queue(TreeOperation::CreateComment { handle, text });
                handle
            }
            Backend::Opless(builder) => builder.create_comment(text),
        }
    }

    // ---- tree shape ----

    pub fn append_child(&mut self, parent: ContentHandle, child: ContentHandle) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::AppendChild { parent, child }),
            Backend::Opless(builder) => {
                let result = builder.append_child(parent, child);
                self.applied("append_child", result);
            }
        }
    }

    pub fn append_to_document(&mut self, child: ContentHandle) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::AppendToDocument { child }),
            Backend::Opless(builder) => {
                let result = builder.append_to_document(child);
                self.applied("append_to_document", result);
            }
        }
    }

    pub fn append_comment_to_document(&mut self, text: String) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::AppendCommentToDocument { text }),
            Backend::Opless(builder) => {
                let result = builder.append_comment_to_document(text);
                self.applied("append_comment_to_document", result);
            }
        }
    }

    pub fn append_doctype_to_document(&mut self, doctype: Doctype) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::AppendDoctypeToDocument {
                name: doctype.name,
                public_id: doctype.public_id,
                system_id: doctype.system_id,
            }),
            Backend::Opless(builder) => {
                let result = builder.append_doctype_to_document(doctype);
                self.applied("append_doctype_to_document", result);
            }
        }
    }

    pub fn insert_before(
        &mut self,
        parent: ContentHandle,
        child: ContentHandle,
        before: ContentHandle,
    ) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::InsertBefore {
                parent,
                child,
                before,
            }),
            Backend::Opless(builder) => {
                let result = builder.insert_before(parent, child, before);
                self.applied("insert_before", result);
            }
        }
    }

    pub fn remove_from_parent(&mut self, node: ContentHandle) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::RemoveFromParent { node }),
            Backend::Opless(builder) => {
                let result = builder.remove_from_parent(node);
                self.applied("remove_from_parent", result);
            }
        }
    }

    pub fn append_children_to_new_parent(
        &mut self,
        old_parent: ContentHandle,
        new_parent: ContentHandle,
    ) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::AppendChildrenToNewParent {
                old_parent,
                new_parent,
            }),
            Backend::Opless(builder) => {
                let result = builder.append_children_to_new_parent(old_parent, new_parent);
                self.applied("append_children_to_new_parent", result);
            }
        }
    }

    pub fn add_attributes_to_element(&mut self, element: ContentHandle, attributes: Vec<Attribute>) {
        self.flush_characters();
        if self.broken.is_broken() || attributes.is_empty() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::AddAttributes {
                element,
                attributes,
            }),
            Backend::Opless(builder) => {
                let result = builder.add_attributes(element, &attributes);
                self.applied("add_attributes", result);
            }
        }
    }

    // ---- templates, shadow roots, forms ----

    pub fn get_document_fragment_for_template(&mut self, template: ContentHandle) -> ContentHandle {
        self.flush_characters();
        match &mut self.backend {
            Backend::Queued(q) => {
                let fragment = q.handles.allocate();
                self.queue(TreeOperation::GetDocumentFragmentForTemplate { template, fragment });
                fragment
            }
            Backend::Opless(builder) => match builder.document_fragment_for_template(template) {
                Ok(fragment) => fragment,
                Err(err) => {
                    self.applied("document_fragment_for_template", Err(err));
                    self.detached.allocate()
                }
            },
        }
    }

    pub fn set_document_fragment_for_template(
        &mut self,
        template: ContentHandle,
        fragment: ContentHandle,
    ) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => {
                self.queue(TreeOperation::SetDocumentFragmentForTemplate { template, fragment })
            }
            Backend::Opless(builder) => {
                let result = builder.set_document_fragment_for_template(template, fragment);
                self.applied("set_document_fragment_for_template", result);
            }
        }
    }

    /// Content root for a declarative shadow root template: the new shadow
    /// root of `host`, or the template's own contents when that fails.
    pub fn get_shadow_root_from_host(
        &mut self,
        host: ContentHandle,
        template: ContentHandle,
        init: ShadowRootInit,
    ) -> ContentHandle {
        self.flush_characters();
        match &mut self.backend {
            Backend::Queued(q) => {
                let fragment = q.handles.allocate();
                self.queue(TreeOperation::GetShadowRootFromHost {
                    host,
                    template,
                    fragment,
                    init,
                });
                fragment
            }
            Backend::Opless(builder) => match builder.shadow_root_from_host(host, template, init) {
                Ok(root) => root,
                Err(err) => {
                    self.applied("shadow_root_from_host", Err(err));
                    self.detached.allocate()
                }
            },
        }
    }

    /// Form owning the fragment-parsing context. Only known in opless mode;
    /// queued parses never have a pre-existing context.
    pub fn get_form_pointer_for_context(&mut self, context: Option<ContentHandle>) -> Option<ContentHandle> {
        let context = context?;
        match &mut self.backend {
            Backend::Queued(_) => None,
            Backend::Opless(builder) => builder.form_pointer_for_context(context),
        }
    }

    pub fn set_form_element(&mut self, element: ContentHandle, form: ContentHandle) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) => self.queue(TreeOperation::SetFormElement { element, form }),
            Backend::Opless(builder) => {
                let result = builder.set_form_element(element, form);
                self.applied("set_form_element", result);
            }
        }
    }

    // ---- scripts and document mode ----

    /// A parser-inserted script element has been closed.
    pub fn script_end(&mut self, script: ContentHandle, line: u32) {
        self.flush_characters();
        if self.broken.is_broken() {
            return;
        }
        match &mut self.backend {
            Backend::Queued(_) if self.config.prevent_script_execution => {
                self.queue(TreeOperation::MarkScriptAlreadyStarted { script })
            }
            Backend::Queued(_) => {
                self.queue(TreeOperation::RunScript { script, line });
                self.request_suspension(SuspendReason::Script);
            }
            Backend::Opless(builder) => {
                let result = builder.mark_script_already_started(script);
                self.applied("mark_script_already_started", result);
            }
        }
    }

    /// Reports the quirks decision. Later calls are ignored.
    pub fn document_mode(&mut self, mode: DocumentMode) {
        if let Some(reported) = self.document_mode {
            log::debug!(target: "html.tree_builder", "document mode already reported as {reported:?}; ignoring {mode:?}");
            return;
        }
        self.document_mode = Some(mode);
        match &mut self.backend {
            Backend::Queued(_) => self.queue_load(SpeculativeLoad::SetDocumentMode(mode)),
            Backend::Opless(builder) => builder.set_document_mode(mode),
        }
    }

    // ---- diagnostics ----

    pub fn report(&mut self, diagnostic: TreeDiagnostic, line: u32) {
        self.diagnostic_count += 1;
        self.diagnostics.report(&diagnostic, line);
        if self.broken.is_broken() {
            return;
        }
        if let Some(hl) = self.view_source.as_mut() {
            if let Err(err) = hl.annotate(&diagnostic, line) {
                self.queue_failed(err);
            }
        }
    }

    // ---- charset protocol ----

    /// Queues an in-order charset control entry for the owner thread.
    pub fn set_document_charset(
        &mut self,
        encoding: Encoding,
        source: CharsetSource,
        commit_encoding_speculation: bool,
    ) {
        if self.is_opless() {
            log::debug!(target: "html.tree_builder", "charset {encoding} ignored in opless mode");
            return;
        }
        self.queue_load(SpeculativeLoad::SetDocumentCharset {
            encoding,
            source,
            commit_encoding_speculation,
        });
    }

    /// Asks the pump loop to restart under `encoding`. Only the first request
    /// of a parse is kept.
    pub fn request_charset_switch(
        &mut self,
        encoding: Encoding,
        source: CharsetSource,
        position: SourcePosition,
    ) {
        let Backend::Queued(q) = &mut self.backend else {
            log::debug!(target: "html.tree_builder", "charset switch ignored in opless mode");
            return;
        };
        if q.charset_switch.is_some() {
            return;
        }
        log::debug!(
            target: "html.tree_builder",
            "charset switch to {encoding} ({source:?}) requested at line {}", position.line
        );
        q.charset_switch = Some(CharsetSwitchRequest {
            encoding,
            source,
            position,
        });
        self.request_suspension(SuspendReason::CharsetSwitch);
    }

    pub fn take_charset_switch(&mut self) -> Option<CharsetSwitchRequest> {
        match &mut self.backend {
            Backend::Queued(q) => q.charset_switch.take(),
            Backend::Opless(_) => None,
        }
    }

    pub fn update_charset_source(&mut self, source: CharsetSource) {
        if self.is_opless() {
            log::debug!(target: "html.tree_builder", "charset source {source:?} ignored in opless mode");
            return;
        }
        self.queue(TreeOperation::UpdateCharsetSource { source });
    }

    pub fn maybe_complain_about_charset(&mut self, message: &'static str, error: bool, line: u32) {
        if self.is_opless() {
            log::debug!(target: "html.tree_builder", "charset complaint at line {line} ignored in opless mode: {message}");
            return;
        }
        self.queue(TreeOperation::MaybeComplainAboutCharset {
            message,
            error,
            line,
        });
    }

    pub fn try_to_enable_encoding_menu(&mut self) {
        if self.is_opless() {
            log::debug!(target: "html.tree_builder", "encoding menu request ignored in opless mode");
            return;
        }
        self.queue(TreeOperation::EnableEncodingMenu);
    }

    // ---- lifecycle ----

    pub fn stream_ended(&mut self) {
        self.flush_characters();
        self.stream_ended = true;
        self.queue(TreeOperation::StreamEnded);
    }

    /// Switches the constructor to plain-text ingestion; markup is not
    /// interpreted from here on.
    pub fn start_plain_text(&mut self) {
        self.plain_text = true;
    }

    /// Substitutes `highlighter`'s operation stream for the builder's.
    pub fn enable_view_source(&mut self, highlighter: Highlighter) {
        if self.is_opless() {
            log::warn!(target: "html.tree_builder", "view source is not available in opless mode");
            return;
        }
        self.view_source = Some(highlighter);
    }

    /// Feeds a token to the view-source highlighter, if enabled.
    pub fn highlight(&mut self, token: &Token) {
        if self.broken.is_broken() {
            return;
        }
        if let Some(hl) = self.view_source.as_mut() {
            if let Err(err) = hl.highlight(token) {
                self.queue_failed(err);
            }
        }
    }

    // ---- flushing ----

    /// Hands buffered work to the consumers. Returns whether any operations
    /// were delivered.
    ///
    /// A discretionary flush leaves a pending run of characters buffered so
    /// that text node shape does not depend on where flushes happen.
    pub fn flush(&mut self, discretionary: bool) -> Result<bool, QueueError> {
        if !discretionary {
            self.flush_characters();
        }
        if self.is_opless() {
            log::warn!(target: "html.tree_builder", "flush called on an opless builder");
            return Ok(false);
        }
        self.flush_loads();
        let Backend::Queued(q) = &mut self.backend else {
            return Ok(false);
        };
        let ops = match self.view_source.as_mut() {
            Some(hl) if !self.broken.is_broken() => {
                let mut ops = hl.take_ops();
                ops.extend(q.ops.take().into_iter().filter(TreeOperation::is_document_level));
                ops
            }
            _ => q.ops.take(),
        };
        if ops.is_empty() {
            return Ok(false);
        }
        let Some(sink) = q.op_sink.as_mut() else {
            log::trace!(target: "html.tree_builder", "no sink; dropping {} ops", ops.len());
            return Ok(false);
        };
        let count = ops.len();
        if let Err(err) = sink.move_ops_from(ops) {
            self.queue_failed(err);
            return Err(err);
        }
        log::trace!(target: "html.tree_builder", "flushed {count} ops (discretionary: {discretionary})");
        Ok(true)
    }

    /// Hands queued speculative loads to the loading stage.
    ///
    /// A stage that refuses a batch loses only its fetches: the parse goes on
    /// and the batch's control entries move to the operation queue.
    pub fn flush_loads(&mut self) -> bool {
        let Backend::Queued(q) = &mut self.backend else {
            return false;
        };
        if q.loads.is_empty() {
            return false;
        }
        let loads = q.loads.take();
        let Some(stage) = q.load_stage.as_mut() else {
            return false;
        };
        let controls: Vec<TreeOperation> = loads
            .iter()
            .filter_map(SpeculativeLoad::control_operation)
            .collect();
        let count = loads.len();
        match stage.move_speculative_loads_from(loads) {
            Ok(()) => {
                log::trace!(target: "html.tree_builder", "flushed {count} speculative loads");
                true
            }
            Err(err) => {
                log::warn!(target: "html.tree_builder", "dropping {count} speculative loads: {err}");
                for op in controls {
                    self.queue(op);
                }
                false
            }
        }
    }

    /// Drops unflushed operations, pending characters included.
    pub fn clear_ops(&mut self) {
        self.pending_text = None;
        if let Backend::Queued(q) = &mut self.backend {
            q.ops.clear();
        }
        if let Some(hl) = self.view_source.as_mut() {
            hl.clear_ops();
        }
    }

    pub fn clear_loads(&mut self) {
        if let Backend::Queued(q) = &mut self.backend {
            q.loads.clear();
        }
    }

    /// Releases every handle minted by this builder in bulk.
    pub fn drop_handles(&mut self) {
        if let Backend::Queued(q) = &mut self.backend {
            q.handles.drop_handles();
        }
        if let Some(hl) = self.view_source.as_mut() {
            hl.drop_handles();
        }
    }
}

impl std::fmt::Debug for TreeBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeBuilder")
            .field("opless", &self.is_opless())
            .field("pending_ops", &self.pending_ops())
            .field("broken", &self.broken.reason())
            .field("suspension", &self.suspension)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
