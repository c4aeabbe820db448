//! Tree operations: the instruction stream replayed on the owner thread.
//!
//! Invariants:
//! - Operations are replayed in the order they were produced, across any
//!   number of flush boundaries.
//! - The operation that creates a handle precedes every operation that reads
//!   or mutates it.
//! - Element and attribute names are canonical ASCII-lowercase.
//! - Attribute order and duplicates are preserved; appliers must not dedupe
//!   (except `AddAttributes`, which only adds names not already present).

use std::sync::Arc;

use crate::broken::BrokenReason;
use crate::charset::{CharsetSource, Encoding};
use crate::handles::ContentHandle;
use crate::types::{Attribute, DocumentMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShadowRootMode {
    Open,
    Closed,
}

impl ShadowRootMode {
    pub fn from_attribute(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("open") {
            Some(ShadowRootMode::Open)
        } else if value.eq_ignore_ascii_case("closed") {
            Some(ShadowRootMode::Closed)
        } else {
            None
        }
    }
}

/// Flags for a declarative shadow root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShadowRootInit {
    pub mode: ShadowRootMode,
    pub clonable: bool,
    pub serializable: bool,
    pub delegates_focus: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeOperation {
    CreateElement {
        handle: ContentHandle,
        name: Arc<str>,
        attributes: Vec<Attribute>,
        line: u32,
    },
    CreateText {
        handle: ContentHandle,
        text: String,
    },
    CreateComment {
        handle: ContentHandle,
        text: String,
    },
    /// Append `child` as the last child of `parent`, detaching it first if needed.
    AppendChild {
        parent: ContentHandle,
        child: ContentHandle,
    },
    /// Append text to `parent`, extending its last child if that is a text node.
    AppendText {
        parent: ContentHandle,
        text: String,
    },
    AppendToDocument {
        child: ContentHandle,
    },
    AppendCommentToDocument {
        text: String,
    },
    AppendDoctypeToDocument {
        name: String,
        public_id: String,
        system_id: String,
    },
    InsertBefore {
        parent: ContentHandle,
        child: ContentHandle,
        before: ContentHandle,
    },
    RemoveFromParent {
        node: ContentHandle,
    },
    AppendChildrenToNewParent {
        old_parent: ContentHandle,
        new_parent: ContentHandle,
    },
    /// Add only the attributes whose names `element` does not have yet.
    AddAttributes {
        element: ContentHandle,
        attributes: Vec<Attribute>,
    },
    /// Resolve `fragment` to the content fragment of `template`.
    GetDocumentFragmentForTemplate {
        template: ContentHandle,
        fragment: ContentHandle,
    },
    SetDocumentFragmentForTemplate {
        template: ContentHandle,
        fragment: ContentHandle,
    },
    /// Resolve `fragment` to a new shadow root on `host`, or to the content of
    /// `template` when the host cannot take one.
    GetShadowRootFromHost {
        host: ContentHandle,
        template: ContentHandle,
        fragment: ContentHandle,
        init: ShadowRootInit,
    },
    SetFormElement {
        element: ContentHandle,
        form: ContentHandle,
    },
    RunScript {
        script: ContentHandle,
        line: u32,
    },
    MarkScriptAlreadyStarted {
        script: ContentHandle,
    },
    UpdateCharsetSource {
        source: CharsetSource,
    },
    MaybeComplainAboutCharset {
        message: &'static str,
        error: bool,
        line: u32,
    },
    EnableEncodingMenu,
    /// Document-level state for owners that run without a load stage.
    SetDocumentCharset {
        encoding: Encoding,
        source: CharsetSource,
    },
    SetDocumentMode {
        mode: DocumentMode,
    },
    StreamEnded,
    MarkAsBroken {
        reason: BrokenReason,
    },
}

impl TreeOperation {
    /// The handle this operation brings into existence, if any.
    pub fn created_handle(&self) -> Option<ContentHandle> {
        match self {
            TreeOperation::CreateElement { handle, .. }
            | TreeOperation::CreateText { handle, .. }
            | TreeOperation::CreateComment { handle, .. } => Some(*handle),
            TreeOperation::GetDocumentFragmentForTemplate { fragment, .. }
            | TreeOperation::GetShadowRootFromHost { fragment, .. } => Some(*fragment),
            _ => None,
        }
    }

    /// Handles this operation reads or mutates (excluding the one it creates).
    pub fn referenced_handles(&self) -> Vec<ContentHandle> {
        match self {
            TreeOperation::AppendChild { parent, child } => vec![*parent, *child],
            TreeOperation::AppendText { parent, .. } => vec![*parent],
            TreeOperation::AppendToDocument { child } => vec![*child],
            TreeOperation::InsertBefore {
                parent,
                child,
                before,
            } => vec![*parent, *child, *before],
            TreeOperation::RemoveFromParent { node } => vec![*node],
            TreeOperation::AppendChildrenToNewParent {
                old_parent,
                new_parent,
            } => vec![*old_parent, *new_parent],
            TreeOperation::AddAttributes { element, .. } => vec![*element],
            TreeOperation::GetDocumentFragmentForTemplate { template, .. } => vec![*template],
            TreeOperation::SetDocumentFragmentForTemplate { template, fragment } => {
                vec![*template, *fragment]
            }
            TreeOperation::GetShadowRootFromHost { host, template, .. } => vec![*host, *template],
            TreeOperation::SetFormElement { element, form } => vec![*element, *form],
            TreeOperation::RunScript { script, .. }
            | TreeOperation::MarkScriptAlreadyStarted { script } => vec![*script],
            TreeOperation::CreateElement { .. }
            | TreeOperation::CreateText { .. }
            | TreeOperation::CreateComment { .. }
            | TreeOperation::AppendCommentToDocument { .. }
            | TreeOperation::AppendDoctypeToDocument { .. }
            | TreeOperation::UpdateCharsetSource { .. }
            | TreeOperation::MaybeComplainAboutCharset { .. }
            | TreeOperation::EnableEncodingMenu
            | TreeOperation::SetDocumentCharset { .. }
            | TreeOperation::SetDocumentMode { .. }
            | TreeOperation::StreamEnded
            | TreeOperation::MarkAsBroken { .. } => Vec::new(),
        }
    }

    /// Document-level operations that view-source output still carries.
    pub fn is_document_level(&self) -> bool {
        matches!(
            self,
            TreeOperation::UpdateCharsetSource { .. }
                | TreeOperation::MaybeComplainAboutCharset { .. }
                | TreeOperation::EnableEncodingMenu
                | TreeOperation::SetDocumentCharset { .. }
                | TreeOperation::SetDocumentMode { .. }
                | TreeOperation::StreamEnded
        )
    }
}
