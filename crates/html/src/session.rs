//! Parse session: bytes in, tree operations out.
//!
//! Chains the stream decoder, tokenizer, tree constructor (or view-source
//! highlighter) and a queued [`TreeBuilder`]. The session never blocks: the
//! caller pushes bytes, then pumps until the session needs input, suspends,
//! or finishes.

use crate::broken::BrokenReason;
use crate::charset::{CharsetSource, CharsetSwitchRequest, Encoding, SourcePosition, StreamDecoder};
use crate::construct::{EncodingDeclaration, TreeConstructor};
use crate::dom::{DomError, NodeKey};
use crate::executor::{ExecutorError, TreeOpExecutor};
use crate::op_queue::{QueueError, TreeOpSink};
use crate::speculative::SpeculativeLoadStage;
use crate::tokenizer::Tokenizer;
use crate::tree_builder::{Highlighter, SuspendReason, TreeBuilder, TreeBuilderConfig};
use crate::types::Token;

/// How the incoming bytes are to be presented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentKind {
    #[default]
    Html,
    PlainText,
    ViewSource,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub builder: TreeBuilderConfig,
    pub content: ContentKind,
    pub encoding: Encoding,
    pub charset_source: CharsetSource,
    /// Buffered operation count that triggers a discretionary flush while pumping.
    pub discretionary_flush_ops: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            builder: TreeBuilderConfig::default(),
            content: ContentKind::Html,
            encoding: Encoding::Utf8,
            charset_source: CharsetSource::Fallback,
            discretionary_flush_ops: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("input after end of stream")]
    Ended,
    #[error("parser broken: {0}")]
    Broken(BrokenReason),
    #[error("flush failed: {0}")]
    Queue(#[from] QueueError),
    #[error("fragment context: {0}")]
    Executor(#[from] ExecutorError),
    #[error("fragment context: {0}")]
    Dom(#[from] DomError),
}

/// Why `pump` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Everything buffered has been consumed.
    NeedsInput,
    /// The builder asked to stop; see [`SuspendReason`].
    Suspended(SuspendReason),
    /// End of stream was processed and all operations were flushed.
    Finished,
}

pub struct HtmlParseSession {
    config: SessionConfig,
    decoder: StreamDecoder,
    decoded: String,
    tokenizer: Tokenizer,
    constructor: TreeConstructor,
    builder: TreeBuilder<'static>,
    charset_source: CharsetSource,
    bytes_seen: usize,
    input_ended: bool,
    finished: bool,
}

impl HtmlParseSession {
    pub fn new(
        config: SessionConfig,
        op_sink: Option<Box<dyn TreeOpSink>>,
        load_stage: Option<Box<dyn SpeculativeLoadStage>>,
    ) -> Self {
        let mut builder_config = config.builder.clone();
        if config.content != ContentKind::Html {
            builder_config.generate_speculative_loads = false;
        }
        let mut builder = TreeBuilder::queued(builder_config, op_sink, load_stage);
        builder.set_document_charset(config.encoding, config.charset_source, false);
        // Transport- and user-chosen encodings are not offered for override.
        if config.charset_source < CharsetSource::HttpHeader {
            builder.try_to_enable_encoding_menu();
        }
        let mut tokenizer = Tokenizer::new();
        let mut constructor = TreeConstructor::new();
        match config.content {
            ContentKind::Html => {}
            ContentKind::PlainText => {
                constructor.start_plain_text(&mut builder);
                tokenizer.set_plain_text();
            }
            ContentKind::ViewSource => builder.enable_view_source(Highlighter::new()),
        }
        log::debug!(
            target: "html.session",
            "session started ({:?}, {} from {:?})",
            config.content, config.encoding, config.charset_source
        );
        Self {
            decoder: StreamDecoder::new(config.encoding),
            decoded: String::new(),
            tokenizer,
            constructor,
            builder,
            charset_source: config.charset_source,
            bytes_seen: 0,
            input_ended: false,
            finished: false,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn builder(&self) -> &TreeBuilder<'static> {
        &self.builder
    }

    pub fn encoding(&self) -> Encoding {
        self.decoder.encoding()
    }

    pub fn charset_source(&self) -> CharsetSource {
        self.charset_source
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.input_ended {
            return Err(SessionError::Ended);
        }
        self.bytes_seen += bytes.len();
        let saw_bom = self.decoder.decode(bytes, &mut self.decoded);
        if saw_bom && self.charset_source < CharsetSource::ByteOrderMark {
            self.charset_source = CharsetSource::ByteOrderMark;
            self.builder
                .set_document_charset(Encoding::Utf8, CharsetSource::ByteOrderMark, true);
        }
        self.feed_decoded();
        Ok(())
    }

    /// Marks the end of input. Call `pump` afterwards to process it.
    pub fn finish(&mut self) {
        if self.input_ended {
            return;
        }
        self.input_ended = true;
        self.decoder.finish(&mut self.decoded);
        self.feed_decoded();
        self.tokenizer.end();
    }

    fn feed_decoded(&mut self) {
        if !self.decoded.is_empty() {
            self.tokenizer.feed(&self.decoded);
            self.decoded.clear();
        }
    }

    /// Runs the tokenizer and tree constructor over buffered input.
    pub fn pump(&mut self) -> Result<PumpOutcome, SessionError> {
        if self.finished {
            return Ok(PumpOutcome::Finished);
        }
        loop {
            if let Some(reason) = self.builder.take_suspension() {
                if reason != SuspendReason::CharsetSwitch {
                    // Ops ahead of a script or the broken marker must reach the owner.
                    self.builder.flush(false)?;
                }
                log::debug!(target: "html.session", "suspended: {reason:?}");
                return Ok(PumpOutcome::Suspended(reason));
            }
            let Some(token) = self.tokenizer.next_token() else {
                return Ok(PumpOutcome::NeedsInput);
            };
            let eof = token == Token::Eof;
            self.builder.highlight(&token);
            self.constructor.process(token, &mut self.builder);
            if self.builder.is_plain_text() {
                self.tokenizer.set_plain_text();
            }
            if let Some(declaration) = self.constructor.take_encoding_declaration() {
                self.encoding_declared(declaration);
            }
            let switching = self.builder.suspension() == Some(SuspendReason::CharsetSwitch);
            if !switching && self.builder.pending_ops() >= self.config.discretionary_flush_ops {
                self.builder.flush(true)?;
            }
            if eof {
                self.finished = true;
                if let Some(reason) = self.builder.take_suspension() {
                    if reason != SuspendReason::CharsetSwitch {
                        self.builder.flush(false)?;
                    }
                    return Ok(PumpOutcome::Suspended(reason));
                }
                self.builder.flush(false)?;
                log::debug!(target: "html.session", "finished after {} bytes", self.bytes_seen);
                return Ok(PumpOutcome::Finished);
            }
        }
    }

    fn encoding_declared(&mut self, declaration: EncodingDeclaration) {
        let line = declaration.line;
        let Some(encoding) = Encoding::for_label(&declaration.label) else {
            log::debug!(target: "html.session", "unsupported encoding label {:?}", declaration.label);
            self.builder
                .maybe_complain_about_charset("EncMetaUnsupported", true, line);
            return;
        };
        if encoding == self.decoder.encoding() {
            if self.charset_source < CharsetSource::Meta {
                self.charset_source = CharsetSource::Meta;
                self.builder.update_charset_source(CharsetSource::Meta);
            }
        } else if self.charset_source.is_tentative() {
            self.builder.request_charset_switch(
                encoding,
                CharsetSource::Meta,
                SourcePosition {
                    line,
                    offset: self.bytes_seen,
                },
            );
        } else {
            self.builder
                .maybe_complain_about_charset("EncMetaTooLate", false, line);
        }
    }

    /// Hands buffered operations and loads to the consumers; see
    /// [`TreeBuilder::flush`].
    pub fn flush(&mut self, discretionary: bool) -> Result<bool, SessionError> {
        Ok(self.builder.flush(discretionary)?)
    }

    pub fn take_charset_switch(&mut self) -> Option<CharsetSwitchRequest> {
        self.builder.take_charset_switch()
    }

    /// Drops unflushed operations and hands pending loads over; used before
    /// a charset restart.
    pub fn discard_for_restart(&mut self) {
        self.builder.clear_ops();
        self.builder.flush_loads();
    }

    /// Stops the session for good: nothing buffered is delivered.
    pub fn abandon(&mut self) {
        self.builder.clear_ops();
        self.builder.clear_loads();
        self.builder.drop_handles();
        self.input_ended = true;
        self.finished = true;
        log::debug!(target: "html.session", "abandoned after {} bytes", self.bytes_seen);
    }
}

impl std::fmt::Debug for HtmlParseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HtmlParseSession")
            .field("content", &self.config.content)
            .field("encoding", &self.decoder.encoding())
            .field("charset_source", &self.charset_source)
            .field("bytes_seen", &self.bytes_seen)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Parses `html` as the children of a new `html` element, in the context of
/// the existing element `context`, applying every node directly to
/// `executor`'s document. Returns the new root.
pub fn parse_fragment(
    executor: &mut TreeOpExecutor,
    context: NodeKey,
    html: &str,
    config: &TreeBuilderConfig,
) -> Result<NodeKey, SessionError> {
    let context_name = executor
        .document()
        .element_name(context)
        .map(str::to_string)
        .ok_or(DomError::WrongNodeKind(context))?;
    let root = executor
        .document_mut()
        .create_element(std::sync::Arc::from("html"), Vec::new());
    let root_handle = executor.handle_for_node(root)?;
    let context_handle = executor.handle_for_node(context)?;

    let mut tokenizer = Tokenizer::new();
    match context_name.as_str() {
        "script" | "style" | "title" | "textarea" | "xmp" | "iframe" | "noembed" | "noframes" => {
            tokenizer.set_raw_text(&context_name)
        }
        "plaintext" => tokenizer.set_plain_text(),
        _ => {}
    }
    tokenizer.feed(html);
    tokenizer.end();

    let mut config = config.clone();
    config.generate_speculative_loads = false;
    let mut builder = TreeBuilder::opless(config, executor);
    let form = builder.get_form_pointer_for_context(Some(context_handle));
    let mut constructor = TreeConstructor::for_fragment(root_handle, form);
    while let Some(token) = tokenizer.next_token() {
        constructor.process(token, &mut builder);
        if let Some(reason) = builder.is_broken() {
            return Err(SessionError::Broken(reason));
        }
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::op_queue::VecOpSink;
    use crate::speculative::{SpeculativeLoad, VecLoadStage};
    use crate::tree_op::TreeOperation;
    use crate::types::Node;

    struct Harness {
        session: HtmlParseSession,
        sink: Arc<Mutex<VecOpSink>>,
        stage: Arc<Mutex<VecLoadStage>>,
    }

    fn harness(config: SessionConfig) -> Harness {
        let sink = Arc::new(Mutex::new(VecOpSink::new()));
        let stage = Arc::new(Mutex::new(VecLoadStage::default()));
        let session = HtmlParseSession::new(
            config,
            Some(Box::new(Arc::clone(&sink))),
            Some(Box::new(Arc::clone(&stage))),
        );
        Harness {
            session,
            sink,
            stage,
        }
    }

    fn replay(h: &Harness) -> TreeOpExecutor {
        let mut exec = TreeOpExecutor::new();
        for load in &h.stage.lock().expect("stage").loads {
            exec.apply_control(load);
        }
        let ops = h.sink.lock().expect("sink").take_ops();
        exec.execute(ops).expect("replay");
        exec
    }

    fn body_names(exec: &TreeOpExecutor) -> Vec<String> {
        let doc = exec.materialize().expect("materialize");
        let body = &doc.children()[0].children()[1];
        body.children()
            .iter()
            .map(|n| n.element_name().unwrap_or("#text").to_string())
            .collect()
    }

    #[test]
    fn chunked_bytes_build_the_same_document() {
        let html = "<!DOCTYPE html><p class=a>caf\u{e9}</p><ul><li>x<li>y</ul>";
        let mut whole = harness(SessionConfig::default());
        whole.session.push_bytes(html.as_bytes()).expect("push");
        whole.session.finish();
        assert_eq!(whole.session.pump().expect("pump"), PumpOutcome::Finished);

        let mut chunked = harness(SessionConfig::default());
        for chunk in html.as_bytes().chunks(3) {
            chunked.session.push_bytes(chunk).expect("push");
            assert_eq!(chunked.session.pump().expect("pump"), PumpOutcome::NeedsInput);
        }
        chunked.session.finish();
        assert_eq!(chunked.session.pump().expect("pump"), PumpOutcome::Finished);

        let a = replay(&whole).materialize().expect("materialize");
        let b = replay(&chunked).materialize().expect("materialize");
        assert_eq!(a, b);
        assert_eq!(body_names(&replay_again(html)), vec!["p", "ul"]);
    }

    fn replay_again(html: &str) -> TreeOpExecutor {
        let mut h = harness(SessionConfig::default());
        h.session.push_bytes(html.as_bytes()).expect("push");
        h.session.finish();
        h.session.pump().expect("pump");
        replay(&h)
    }

    #[test]
    fn script_end_suspends_after_flushing() {
        let mut h = harness(SessionConfig::default());
        h.session
            .push_bytes(b"<script>go()</script><p>after")
            .expect("push");
        h.session.finish();
        assert_eq!(
            h.session.pump().expect("pump"),
            PumpOutcome::Suspended(SuspendReason::Script)
        );
        let flushed = h.sink.lock().expect("sink").take_ops();
        assert!(matches!(flushed.last(), Some(TreeOperation::RunScript { .. })));
        assert_eq!(h.session.pump().expect("pump"), PumpOutcome::Finished);
        let rest = h.sink.lock().expect("sink").take_ops();
        assert!(matches!(rest.last(), Some(TreeOperation::StreamEnded)));
    }

    #[test]
    fn late_meta_with_other_encoding_requests_a_switch() {
        let mut h = harness(SessionConfig {
            encoding: Encoding::Windows1252,
            ..SessionConfig::default()
        });
        h.session
            .push_bytes(b"<head><meta charset=utf-8><title>x</title>")
            .expect("push");
        assert_eq!(
            h.session.pump().expect("pump"),
            PumpOutcome::Suspended(SuspendReason::CharsetSwitch)
        );
        let request = h.session.take_charset_switch().expect("switch");
        assert_eq!(request.encoding, Encoding::Utf8);
        assert_eq!(request.source, CharsetSource::Meta);
        h.session.discard_for_restart();
        assert_eq!(h.session.builder().pending_ops(), 0);
        assert!(h.sink.lock().expect("sink").batches.is_empty());
    }

    #[test]
    fn charset_switch_holds_back_the_threshold_flush() {
        let mut h = harness(SessionConfig {
            encoding: Encoding::Windows1252,
            discretionary_flush_ops: 1,
            ..SessionConfig::default()
        });
        h.session.push_bytes(b"<meta charset=utf-8>").expect("push");
        assert_eq!(
            h.session.pump().expect("pump"),
            PumpOutcome::Suspended(SuspendReason::CharsetSwitch)
        );
        assert!(h.sink.lock().expect("sink").batches.is_empty());
        assert!(h.session.builder().pending_ops() > 0);
    }

    #[test]
    fn matching_meta_confirms_the_encoding() {
        let mut h = harness(SessionConfig::default());
        h.session.push_bytes(b"<meta charset=UTF-8>").expect("push");
        h.session.finish();
        assert_eq!(h.session.pump().expect("pump"), PumpOutcome::Finished);
        assert_eq!(h.session.charset_source(), CharsetSource::Meta);
        let exec = replay(&h);
        assert_eq!(exec.charset(), Some((Encoding::Utf8, CharsetSource::Meta)));
        assert!(exec.encoding_menu_enabled());
    }

    #[test]
    fn authoritative_encoding_complains_instead_of_switching() {
        let mut h = harness(SessionConfig {
            charset_source: CharsetSource::HttpHeader,
            ..SessionConfig::default()
        });
        h.session
            .push_bytes(b"<meta charset=windows-1252><p>x")
            .expect("push");
        h.session.finish();
        assert_eq!(h.session.pump().expect("pump"), PumpOutcome::Finished);
        let exec = replay(&h);
        assert_eq!(exec.charset_complaints()[0].message, "EncMetaTooLate");
        assert!(!exec.encoding_menu_enabled());
    }

    #[test]
    fn plain_text_keeps_markup_as_text() {
        let mut h = harness(SessionConfig {
            content: ContentKind::PlainText,
            ..SessionConfig::default()
        });
        h.session.push_bytes(b"<b>not bold</b>").expect("push");
        h.session.finish();
        assert_eq!(h.session.pump().expect("pump"), PumpOutcome::Finished);
        let doc = replay(&h).materialize().expect("materialize");
        let pre = &doc.children()[0].children()[1].children()[0];
        assert_eq!(pre.element_name(), Some("pre"));
        let Node::Text { text, .. } = &pre.children()[0] else {
            panic!("text expected");
        };
        assert_eq!(text, "<b>not bold</b>");
        assert!(
            !h.stage
                .lock()
                .expect("stage")
                .loads
                .iter()
                .any(SpeculativeLoad::is_fetch)
        );
    }

    #[test]
    fn view_source_delivers_highlighted_markup() {
        let mut h = harness(SessionConfig {
            content: ContentKind::ViewSource,
            ..SessionConfig::default()
        });
        h.session.push_bytes(b"<p>x</div>").expect("push");
        h.session.finish();
        assert_eq!(h.session.pump().expect("pump"), PumpOutcome::Finished);
        let doc = replay(&h).materialize().expect("materialize");
        let pre = &doc.children()[0].children()[0].children()[0];
        assert_eq!(pre.element_name(), Some("pre"));
        assert_eq!(pre.children().len(), 3);
    }

    #[test]
    fn view_source_keeps_document_level_operations() {
        let mut h = harness(SessionConfig {
            content: ContentKind::ViewSource,
            ..SessionConfig::default()
        });
        h.session.push_bytes(b"<meta charset=utf-8>x").expect("push");
        h.session.finish();
        assert_eq!(h.session.pump().expect("pump"), PumpOutcome::Finished);
        let exec = replay(&h);
        assert!(exec.stream_ended());
        assert!(exec.encoding_menu_enabled());
        assert_eq!(exec.charset(), Some((Encoding::Utf8, CharsetSource::Meta)));
    }

    #[test]
    fn abandoned_sessions_deliver_nothing() {
        let mut h = harness(SessionConfig::default());
        h.session.push_bytes(b"<p>lost").expect("push");
        h.session.abandon();
        assert_eq!(h.session.pump().expect("pump"), PumpOutcome::Finished);
        assert!(h.sink.lock().expect("sink").batches.is_empty());
        assert!(matches!(h.session.push_bytes(b"x"), Err(SessionError::Ended)));
    }

    #[test]
    fn fragments_parse_into_a_detached_root() {
        let mut exec = TreeOpExecutor::new();
        let mut h = harness(SessionConfig::default());
        h.session.push_bytes(b"<form><div id=ctx></div></form>").expect("push");
        h.session.finish();
        h.session.pump().expect("pump");
        let ops = h.sink.lock().expect("sink").take_ops();
        exec.execute(ops).expect("replay");
        let doc = exec.materialize().expect("materialize");
        let div = &doc.children()[0].children()[1].children()[0].children()[0];
        let context = NodeKey(div.id().0);

        let root = parse_fragment(
            &mut exec,
            context,
            "<input name=q><b>bold",
            &TreeBuilderConfig::default(),
        )
        .expect("fragment");
        let root = exec.document().materialize_node(root).expect("root");
        let names: Vec<_> = root.children().iter().filter_map(Node::element_name).collect();
        assert_eq!(names, vec!["input", "b"]);
        let Node::Element { form_owner, .. } = &root.children()[0] else {
            panic!("input expected");
        };
        assert!(form_owner.is_some());
    }
}
