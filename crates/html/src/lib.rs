//! Incremental HTML tree building across a thread boundary.
//!
//! A parser running off the owner thread cannot touch the DOM. It drives a
//! [`TreeBuilder`], which records every decision as a [`TreeOperation`]
//! addressed by [`ContentHandle`]s and hands whole batches to a
//! [`TreeOpSink`]; the owner replays them with a [`TreeOpExecutor`].
//! Speculative subresource loads travel in a separate queue so fetching can
//! start before the tree arrives. For synchronous parsing (fragments) the
//! same builder runs opless, straight against the executor.

pub mod broken;
pub mod charset;
pub mod construct;
pub mod debug;
pub mod diagnostics;
pub mod dom;
pub mod executor;
pub mod handles;
pub mod op_queue;
pub mod session;
pub mod speculative;
pub mod tokenizer;
pub mod tree_builder;
pub mod tree_op;
mod types;

use memchr::{memchr, memchr2};

pub use crate::broken::BrokenReason;
pub use crate::charset::{CharsetSource, CharsetSwitchRequest, Encoding, SourcePosition};
pub use crate::construct::TreeConstructor;
pub use crate::diagnostics::{CollectDiagnostics, DiagnosticsSink, LogDiagnostics, TreeDiagnostic};
pub use crate::dom::{Document, DomError, NodeKey};
pub use crate::executor::{ExecuteSummary, ExecutorError, TreeOpExecutor};
pub use crate::handles::{ContentHandle, HandleTable};
pub use crate::op_queue::{QueueError, TreeOpSink, VecOpSink};
pub use crate::session::{
    ContentKind, HtmlParseSession, PumpOutcome, SessionConfig, SessionError, parse_fragment,
};
pub use crate::speculative::{
    LoadRequest, LoadResolver, SpeculativeLoad, SpeculativeLoadStage, VecLoadStage,
};
pub use crate::tokenizer::Tokenizer;
pub use crate::tree_builder::{
    Highlighter, OplessBuilder, SuspendReason, TreeBuilder, TreeBuilderConfig,
};
pub use crate::tree_op::TreeOperation;
pub use crate::types::{Attribute, Doctype, DocumentMode, Id, Node, Token, attribute_value};

/// How to present a response with the given `Content-Type`, or `None` when
/// it is not something this parser handles.
pub fn content_kind_for(content_type: Option<&str>) -> Option<ContentKind> {
    let value = content_type?;
    if contains_ignore_ascii_case(value, b"text/html")
        || contains_ignore_ascii_case(value, b"application/xhtml")
    {
        Some(ContentKind::Html)
    } else if contains_ignore_ascii_case(value, b"text/plain") {
        Some(ContentKind::PlainText)
    } else {
        None
    }
}

fn contains_ignore_ascii_case(haystack: &str, needle: &[u8]) -> bool {
    let hay = haystack.as_bytes();
    let n = needle.len();
    if n == 0 {
        return true;
    }
    if hay.len() < n {
        return false;
    }
    let first = needle[0];
    let (a, b) = (first.to_ascii_lowercase(), first.to_ascii_uppercase());
    let mut i = 0;
    while i + n <= hay.len() {
        let rel = if a == b {
            memchr(a, &hay[i..])
        } else {
            memchr2(a, b, &hay[i..])
        };
        let Some(rel) = rel else {
            return false;
        };
        let pos = i + rel;
        if pos + n <= hay.len() && hay[pos..pos + n].eq_ignore_ascii_case(needle) {
            return true;
        }
        i = pos + 1;
    }
    false
}
