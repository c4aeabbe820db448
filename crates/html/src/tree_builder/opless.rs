//! Synchronous owner-thread builder used by opless mode.

use std::sync::Arc;

use crate::broken::BrokenReason;
use crate::executor::ExecutorError;
use crate::handles::ContentHandle;
use crate::tree_op::ShadowRootInit;
use crate::types::{Attribute, Doctype, DocumentMode};

/// Applies tree-construction decisions to real nodes immediately.
///
/// Creation never fails; mutations report failures, which the tree builder
/// turns into a broken state. Handles returned here are already resolved.
pub trait OplessBuilder {
    fn create_element(&mut self, name: Arc<str>, attributes: Vec<Attribute>, line: u32)
    -> ContentHandle;
    fn create_text(&mut self, text: String) -> ContentHandle;
    fn create_comment(&mut self, text: String) -> ContentHandle;

    fn append_child(
        &mut self,
        parent: ContentHandle,
        child: ContentHandle,
    ) -> Result<(), ExecutorError>;
    fn append_text(&mut self, parent: ContentHandle, text: &str) -> Result<(), ExecutorError>;
    fn append_to_document(&mut self, child: ContentHandle) -> Result<(), ExecutorError>;
    fn append_comment_to_document(&mut self, text: String) -> Result<(), ExecutorError>;
    fn append_doctype_to_document(&mut self, doctype: Doctype) -> Result<(), ExecutorError>;
    fn insert_before(
        &mut self,
        parent: ContentHandle,
        child: ContentHandle,
        before: ContentHandle,
    ) -> Result<(), ExecutorError>;
    fn remove_from_parent(&mut self, node: ContentHandle) -> Result<(), ExecutorError>;
    fn append_children_to_new_parent(
        &mut self,
        old_parent: ContentHandle,
        new_parent: ContentHandle,
    ) -> Result<(), ExecutorError>;
    fn add_attributes(
        &mut self,
        element: ContentHandle,
        attributes: &[Attribute],
    ) -> Result<(), ExecutorError>;

    fn document_fragment_for_template(
        &mut self,
        template: ContentHandle,
    ) -> Result<ContentHandle, ExecutorError>;
    fn set_document_fragment_for_template(
        &mut self,
        template: ContentHandle,
        fragment: ContentHandle,
    ) -> Result<(), ExecutorError>;
    fn shadow_root_from_host(
        &mut self,
        host: ContentHandle,
        template: ContentHandle,
        init: ShadowRootInit,
    ) -> Result<ContentHandle, ExecutorError>;
    /// Nearest `form` ancestor of a fragment-parsing context element.
    fn form_pointer_for_context(&mut self, context: ContentHandle) -> Option<ContentHandle>;
    fn set_form_element(
        &mut self,
        element: ContentHandle,
        form: ContentHandle,
    ) -> Result<(), ExecutorError>;
    fn mark_script_already_started(&mut self, script: ContentHandle)
    -> Result<(), ExecutorError>;

    fn set_document_mode(&mut self, mode: DocumentMode);
    fn mark_as_broken(&mut self, reason: BrokenReason);
}
