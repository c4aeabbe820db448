//! View-source highlighting: an alternate consumer of the token stream.
//!
//! The highlighter builds its own document (`html > body > pre`) out of
//! classed spans, one per markup token, and hands its operations to the sink
//! in place of the tree builder's. Diagnostics raised while the source is
//! shown become error annotations on the span of the offending token.

use std::sync::Arc;

use crate::diagnostics::TreeDiagnostic;
use crate::handles::{ContentHandle, HandleTable};
use crate::op_queue::{OpQueue, QueueError};
use crate::tree_op::TreeOperation;
use crate::types::{Attribute, Token};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorAnnotation {
    pub id: &'static str,
    pub line: u32,
}

#[derive(Debug, Default)]
pub struct Highlighter {
    handles: HandleTable,
    ops: OpQueue,
    pre: Option<ContentHandle>,
    current: Option<ContentHandle>,
    annotations: Vec<ErrorAnnotation>,
}

impl Highlighter {
    pub fn new() -> Self {
        Self::default()
    }

    fn element(&mut self, name: &str, attributes: Vec<Attribute>) -> Result<ContentHandle, QueueError> {
        let handle = self.handles.allocate();
        self.ops.push(TreeOperation::CreateElement {
            handle,
            name: Arc::from(name),
            attributes,
            line: 0,
        })?;
        Ok(handle)
    }

    fn pre(&mut self) -> Result<ContentHandle, QueueError> {
        if let Some(pre) = self.pre {
            return Ok(pre);
        }
        let html = self.element("html", Vec::new())?;
        self.ops.push(TreeOperation::AppendToDocument { child: html })?;
        let body = self.element("body", Vec::new())?;
        self.ops.push(TreeOperation::AppendChild {
            parent: html,
            child: body,
        })?;
        let pre = self.element("pre", vec![Attribute::new("id", "line1")])?;
        self.ops.push(TreeOperation::AppendChild {
            parent: body,
            child: pre,
        })?;
        self.pre = Some(pre);
        Ok(pre)
    }

    fn span(&mut self, class: &'static str, source: String) -> Result<(), QueueError> {
        let pre = self.pre()?;
        let span = self.element("span", vec![Attribute::new("class", class)])?;
        self.ops.push(TreeOperation::AppendText {
            parent: span,
            text: source,
        })?;
        self.ops.push(TreeOperation::AppendChild {
            parent: pre,
            child: span,
        })?;
        self.current = Some(span);
        Ok(())
    }

    pub fn highlight(&mut self, token: &Token) -> Result<(), QueueError> {
        match token {
            Token::Doctype { doctype, .. } => {
                self.span("doctype", format!("<!DOCTYPE {}>", doctype.name))
            }
            Token::StartTag {
                name,
                attributes,
                self_closing,
                ..
            } => {
                let mut source = format!("<{name}");
                for attr in attributes {
                    source.push(' ');
                    source.push_str(&attr.name);
                    if !attr.value.is_empty() {
                        source.push_str("=\"");
                        source.push_str(&attr.value);
                        source.push('"');
                    }
                }
                source.push_str(if *self_closing { " />" } else { ">" });
                self.span("start-tag", source)
            }
            Token::EndTag { name, .. } => self.span("end-tag", format!("</{name}>")),
            Token::Comment(text) => self.span("comment", format!("<!--{text}-->")),
            Token::Characters(text) => {
                let pre = self.pre()?;
                self.current = None;
                self.ops.push(TreeOperation::AppendText {
                    parent: pre,
                    text: text.clone(),
                })
            }
            Token::Eof => Ok(()),
        }
    }

    /// Attaches a diagnostic to the span of the most recent markup token.
    pub fn annotate(&mut self, diagnostic: &TreeDiagnostic, line: u32) -> Result<(), QueueError> {
        self.annotations.push(ErrorAnnotation {
            id: diagnostic.id(),
            line,
        });
        let Some(current) = self.current else {
            return Ok(());
        };
        self.ops.push(TreeOperation::AddAttributes {
            element: current,
            attributes: vec![
                Attribute::new("data-error", diagnostic.id()),
                Attribute::new("title", diagnostic.to_string()),
            ],
        })
    }

    pub fn annotations(&self) -> &[ErrorAnnotation] {
        &self.annotations
    }

    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn take_ops(&mut self) -> Vec<TreeOperation> {
        self.ops.take()
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    pub fn drop_handles(&mut self) {
        self.handles.drop_handles();
        self.pre = None;
        self.current = None;
    }
}
