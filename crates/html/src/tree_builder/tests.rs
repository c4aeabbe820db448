use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::*;
use crate::executor::TreeOpExecutor;
use crate::op_queue::VecOpSink;
use crate::speculative::VecLoadStage;
use crate::tree_op::ShadowRootMode;
use crate::types::Node;

type SharedSink = Arc<Mutex<VecOpSink>>;
type SharedStage = Arc<Mutex<VecLoadStage>>;

fn queued_with(config: TreeBuilderConfig) -> (TreeBuilder<'static>, SharedSink, SharedStage) {
    let sink = Arc::new(Mutex::new(VecOpSink::new()));
    let stage = Arc::new(Mutex::new(VecLoadStage::default()));
    let builder = TreeBuilder::queued(
        config,
        Some(Box::new(Arc::clone(&sink))),
        Some(Box::new(Arc::clone(&stage))),
    );
    (builder, sink, stage)
}

fn queued() -> (TreeBuilder<'static>, SharedSink, SharedStage) {
    queued_with(TreeBuilderConfig::default())
}

fn batches(sink: &SharedSink) -> Vec<Vec<TreeOperation>> {
    sink.lock().expect("sink lock").batches.clone()
}

fn el(b: &mut TreeBuilder<'_>, name: &str, attrs: &[(&str, &str)]) -> ContentHandle {
    let attributes = attrs.iter().map(|(n, v)| Attribute::new(*n, *v)).collect();
    b.create_element(Arc::from(name), attributes, 1)
}

/// Drives a builder through a representative document, flushing along the way
/// when `flush_every` is set.
fn build_sample(b: &mut TreeBuilder<'_>, flush_every: Option<usize>) {
    let mut step = 0usize;
    let mut maybe_flush = |b: &mut TreeBuilder<'_>| {
        step += 1;
        if flush_every.is_some_and(|n| step % n == 0) && !b.is_opless() {
            b.flush(true).expect("flush");
        }
    };
    b.append_doctype_to_document(Doctype {
        name: "html".to_string(),
        public_id: String::new(),
        system_id: String::new(),
    });
    b.document_mode(DocumentMode::Standards);
    b.append_comment_to_document("lead".to_string());
    let html = el(b, "html", &[("lang", "en")]);
    b.append_to_document(html);
    maybe_flush(b);
    let head = el(b, "head", &[]);
    b.append_child(html, head);
    let body = el(b, "body", &[("class", "a")]);
    b.append_child(html, body);
    b.add_attributes_to_element(body, vec![Attribute::new("class", "b"), Attribute::new("id", "x")]);
    maybe_flush(b);
    let p = el(b, "p", &[]);
    b.append_child(body, p);
    b.append_characters(p, "hello ");
    maybe_flush(b);
    b.append_characters(p, "world");
    let em = el(b, "em", &[]);
    b.append_child(p, em);
    b.append_characters(em, "!");
    maybe_flush(b);
    let first = el(b, "li", &[]);
    let second = el(b, "li", &[]);
    let ul = el(b, "ul", &[]);
    b.append_child(body, ul);
    b.append_child(ul, second);
    b.insert_before(ul, first, second);
    maybe_flush(b);
    let template = el(b, "template", &[]);
    b.append_child(body, template);
    let contents = b.get_document_fragment_for_template(template);
    let inner = el(b, "span", &[]);
    b.append_child(contents, inner);
    maybe_flush(b);
    let host = el(b, "div", &[]);
    b.append_child(body, host);
    let shadow_template = el(b, "template", &[("shadowrootmode", "open")]);
    let root = b.get_shadow_root_from_host(
        host,
        shadow_template,
        ShadowRootInit {
            mode: ShadowRootMode::Open,
            clonable: false,
            serializable: false,
            delegates_focus: false,
        },
    );
    let slot = el(b, "slot", &[]);
    b.append_child(root, slot);
    maybe_flush(b);
    let form = el(b, "form", &[]);
    b.append_child(body, form);
    let input = el(b, "input", &[("name", "q")]);
    b.append_child(form, input);
    b.set_form_element(input, form);
    let stray = b.create_comment("moved".to_string());
    b.append_child(p, stray);
    b.remove_from_parent(stray);
    b.append_child(form, stray);
    let adopt = el(b, "section", &[]);
    b.append_child(body, adopt);
    b.append_children_to_new_parent(form, adopt);
    let text = b.create_text_node("tail".to_string());
    b.append_child(body, text);
    b.stream_ended();
}

fn replay(sink: &SharedSink) -> TreeOpExecutor {
    let mut exec = TreeOpExecutor::new();
    for batch in batches(sink) {
        exec.execute(batch).expect("replay");
    }
    exec
}

#[test]
fn queued_replay_matches_opless_build() {
    let (mut b, sink, stage) = queued();
    build_sample(&mut b, None);
    assert!(b.flush(false).expect("flush"));
    let mut exec = TreeOpExecutor::new();
    for load in &stage.lock().expect("stage lock").loads {
        exec.apply_control(load);
    }
    for batch in batches(&sink) {
        exec.execute(batch).expect("replay");
    }
    let queued_doc = exec.materialize().expect("materialize");

    let mut exec = TreeOpExecutor::new();
    {
        let mut opless = TreeBuilder::opless(TreeBuilderConfig::default(), &mut exec);
        build_sample(&mut opless, None);
        assert_eq!(opless.is_broken(), None);
        assert!(opless.is_opless());
    }
    let opless_doc = exec.materialize().expect("materialize");
    assert_eq!(queued_doc, opless_doc);
}

#[test]
fn flush_partitioning_does_not_change_the_stream() {
    let (mut once, once_sink, _) = queued();
    build_sample(&mut once, None);
    once.flush(false).expect("flush");
    let (mut often, often_sink, _) = queued();
    build_sample(&mut often, Some(1));
    often.flush(false).expect("flush");

    assert_eq!(batches(&once_sink).len(), 1);
    assert!(batches(&often_sink).len() > 1);
    let strip = |sink: &SharedSink| -> Vec<String> {
        sink.lock()
            .expect("sink lock")
            .ops()
            .map(|op| format!("{:?}", std::mem::discriminant(op)))
            .collect()
    };
    assert_eq!(strip(&once_sink), strip(&often_sink));
    assert_eq!(
        replay(&once_sink).materialize().expect("once"),
        replay(&often_sink).materialize().expect("often")
    );
}

#[test]
fn creating_operation_precedes_every_use() {
    let (mut b, sink, _) = queued();
    build_sample(&mut b, Some(2));
    b.flush(false).expect("flush");
    let mut created = HashSet::new();
    for op in sink.lock().expect("sink lock").ops() {
        for used in op.referenced_handles() {
            assert!(created.contains(&used), "{used:?} used before creation in {op:?}");
        }
        if let Some(handle) = op.created_handle() {
            assert!(created.insert(handle), "{handle:?} created twice");
        }
    }
}

#[test]
fn children_attached_before_parent_reaches_root() {
    let (mut b, sink, _) = queued();
    let div = el(&mut b, "div", &[]);
    let hi = b.create_text_node("hi".to_string());
    b.append_child(div, hi);
    assert!(b.flush(false).expect("first flush"));
    b.append_to_document(div);
    assert!(b.flush(false).expect("second flush"));
    assert_eq!(batches(&sink).len(), 2);

    let doc = replay(&sink).materialize().expect("materialize");
    let Node::Document { children, .. } = &doc else {
        panic!("expected document root");
    };
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].element_name(), Some("div"));
    let Node::Text { text, .. } = &children[0].children()[0] else {
        panic!("expected text child");
    };
    assert_eq!(text, "hi");
}

#[test]
fn charset_switch_lets_caller_discard_unflushed_ops() {
    let (mut b, sink, _) = queued();
    let root = el(&mut b, "html", &[]);
    b.append_to_document(root);
    for _ in 0..4 {
        let child = el(&mut b, "p", &[]);
        b.append_child(root, child);
    }
    assert_eq!(b.pending_ops(), 10);

    b.request_charset_switch(
        Encoding::Windows1252,
        CharsetSource::Meta,
        SourcePosition { line: 3, offset: 120 },
    );
    b.request_charset_switch(Encoding::Utf8, CharsetSource::HttpHeader, SourcePosition::default());
    assert_eq!(b.take_suspension(), Some(SuspendReason::CharsetSwitch));
    let request = b.take_charset_switch().expect("switch requested");
    assert_eq!(request.encoding, Encoding::Windows1252);
    assert_eq!(request.position.line, 3);

    b.clear_ops();
    assert!(!b.flush(false).expect("flush"));
    assert!(batches(&sink).is_empty());
}

#[test]
fn five_thousand_ops_in_one_discretionary_flush() {
    let (mut b, sink, _) = queued();
    let mut expected = Vec::with_capacity(5_000);
    for n in 0..5_000 {
        let handle = b.create_comment(n.to_string());
        expected.push(TreeOperation::CreateComment {
            handle,
            text: n.to_string(),
        });
    }
    assert!(b.flush(true).expect("flush"));
    assert_eq!(b.pending_ops(), 0);
    {
        let sink = sink.lock().expect("sink lock");
        assert_eq!(sink.batches.len(), 1);
        assert_eq!(sink.batches[0], expected);
    }
    b.create_comment("again".to_string());
    assert_eq!(b.pending_ops(), 1);
}

#[test]
fn discretionary_flush_keeps_text_runs_whole() {
    let (mut b, sink, _) = queued();
    let p = el(&mut b, "p", &[]);
    b.append_to_document(p);
    b.append_characters(p, "ab");
    b.flush(true).expect("discretionary");
    b.append_characters(p, "cd");
    b.flush(false).expect("final");
    let texts: Vec<_> = sink
        .lock()
        .expect("sink lock")
        .ops()
        .filter_map(|op| match op {
            TreeOperation::AppendText { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["abcd".to_string()]);
}

#[test]
fn op_cap_breaks_the_builder_once() {
    let (mut b, sink, _) = queued_with(TreeBuilderConfig {
        max_queued_ops: Some(3),
        ..TreeBuilderConfig::default()
    });
    for _ in 0..5 {
        el(&mut b, "div", &[]);
    }
    assert_eq!(b.is_broken(), Some(BrokenReason::OutOfMemory));
    assert_eq!(b.take_suspension(), Some(SuspendReason::Broken));
    assert_eq!(b.suspension(), Some(SuspendReason::Broken));
    assert_eq!(
        b.queued_ops(),
        &[TreeOperation::MarkAsBroken {
            reason: BrokenReason::OutOfMemory
        }]
    );

    b.mark_as_broken(BrokenReason::SinkClosed);
    assert_eq!(b.is_broken(), Some(BrokenReason::OutOfMemory));
    b.flush(false).expect("flush broken marker");
    let exec = replay(&sink);
    assert_eq!(exec.broken(), Some(BrokenReason::OutOfMemory));
}

#[test]
fn closed_sink_marks_broken() {
    struct Closed;
    impl TreeOpSink for Closed {
        fn move_ops_from(&mut self, _ops: Vec<TreeOperation>) -> Result<(), QueueError> {
            Err(QueueError::SinkClosed)
        }
    }
    let mut b = TreeBuilder::queued(TreeBuilderConfig::default(), Some(Box::new(Closed)), None);
    el(&mut b, "div", &[]);
    assert_eq!(b.flush(false), Err(QueueError::SinkClosed));
    assert_eq!(b.is_broken(), Some(BrokenReason::SinkClosed));
}

#[test]
fn scripts_suspend_unless_execution_is_prevented() {
    let (mut b, _, _) = queued();
    let script = el(&mut b, "script", &[]);
    b.script_end(script, 7);
    assert_eq!(b.take_suspension(), Some(SuspendReason::Script));
    assert!(matches!(
        b.queued_ops().last(),
        Some(TreeOperation::RunScript { line: 7, .. })
    ));

    let (mut b, _, _) = queued_with(TreeBuilderConfig {
        prevent_script_execution: true,
        ..TreeBuilderConfig::default()
    });
    let script = el(&mut b, "script", &[]);
    b.script_end(script, 7);
    assert_eq!(b.take_suspension(), None);
    assert!(matches!(
        b.queued_ops().last(),
        Some(TreeOperation::MarkScriptAlreadyStarted { .. })
    ));
}

#[test]
fn suspension_keeps_highest_priority() {
    let (mut b, _, _) = queued();
    b.request_suspension(SuspendReason::CharsetSwitch);
    b.request_suspension(SuspendReason::Script);
    assert_eq!(b.take_suspension(), Some(SuspendReason::CharsetSwitch));
    assert_eq!(b.take_suspension(), None);
}

#[test]
fn speculative_loads_and_document_mode_reach_the_stage() {
    let (mut b, _, stage) = queued();
    el(&mut b, "img", &[("src", "a.png")]);
    el(&mut b, "link", &[("rel", "stylesheet"), ("href", "s.css")]);
    b.document_mode(DocumentMode::Quirks);
    b.document_mode(DocumentMode::Standards);
    assert_eq!(b.reported_document_mode(), Some(DocumentMode::Quirks));
    assert_eq!(b.pending_loads(), 3);
    b.flush(true).expect("flush");
    let stage = stage.lock().expect("stage lock");
    assert_eq!(stage.loads.len(), 3);
    assert!(stage.loads[0].is_fetch());
    assert_eq!(
        stage.loads[2],
        SpeculativeLoad::SetDocumentMode(DocumentMode::Quirks)
    );
}

#[test]
fn eager_loads_skip_the_flush() {
    let (mut b, sink, stage) = queued_with(TreeBuilderConfig {
        eager_speculative_loads: true,
        ..TreeBuilderConfig::default()
    });
    el(&mut b, "script", &[("src", "app.js")]);
    assert_eq!(stage.lock().expect("stage lock").loads.len(), 1);
    assert!(batches(&sink).is_empty());
}

#[test]
fn disabled_generation_still_carries_control_entries() {
    let (mut b, _, stage) = queued_with(TreeBuilderConfig {
        generate_speculative_loads: false,
        ..TreeBuilderConfig::default()
    });
    el(&mut b, "img", &[("src", "a.png")]);
    b.set_document_charset(Encoding::Utf8, CharsetSource::ByteOrderMark, false);
    b.flush(false).expect("flush");
    let stage = stage.lock().expect("stage lock");
    assert_eq!(stage.loads.len(), 1);
    assert!(matches!(
        stage.loads[0],
        SpeculativeLoad::SetDocumentCharset { .. }
    ));
}

#[test]
fn opless_failure_marks_broken_and_stops_work() {
    let mut exec = TreeOpExecutor::new();
    {
        let mut b = TreeBuilder::opless(TreeBuilderConfig::default(), &mut exec);
        let text = b.create_text_node("x".to_string());
        let div = el(&mut b, "div", &[]);
        b.append_child(text, div);
        assert_eq!(
            b.is_broken(),
            Some(BrokenReason::MutationFailed("append_child"))
        );
        assert_eq!(b.take_suspension(), Some(SuspendReason::Broken));
        b.append_to_document(div);
        assert_eq!(b.flush(false), Ok(false));
        b.request_charset_switch(Encoding::Utf8, CharsetSource::Meta, SourcePosition::default());
        assert_eq!(b.take_charset_switch(), None);
    }
    assert_eq!(exec.broken(), Some(BrokenReason::MutationFailed("append_child")));
    assert!(exec.document().children(crate::dom::NodeKey::DOCUMENT).expect("doc").is_empty());
}

#[test]
fn form_pointer_only_exists_in_opless_mode() {
    let (mut b, _, _) = queued();
    let input = el(&mut b, "input", &[]);
    assert_eq!(b.get_form_pointer_for_context(Some(input)), None);

    let mut exec = TreeOpExecutor::new();
    let mut b = TreeBuilder::opless(TreeBuilderConfig::default(), &mut exec);
    let form = el(&mut b, "form", &[]);
    let div = el(&mut b, "div", &[]);
    b.append_to_document(form);
    b.append_child(form, div);
    assert!(b.get_form_pointer_for_context(Some(div)).is_some());
    assert_eq!(b.get_form_pointer_for_context(None), None);
}

#[test]
fn diagnostics_are_counted_and_never_break() {
    let collected = Arc::new(Mutex::new(crate::diagnostics::CollectDiagnostics::default()));
    let (b, _, _) = queued();
    let mut b = b.with_diagnostics(Box::new(Arc::clone(&collected)));
    b.report(TreeDiagnostic::StrayEndTag(Arc::from("p")), 4);
    b.report(TreeDiagnostic::SelfClosing, 5);
    assert_eq!(b.diagnostic_count(), 2);
    assert_eq!(b.is_broken(), None);
    assert_eq!(b.take_suspension(), None);
    assert_eq!(collected.lock().expect("lock").reported.len(), 2);
}

#[test]
fn view_source_substitutes_the_highlighter_stream() {
    let (mut b, sink, _) = queued();
    b.enable_view_source(Highlighter::new());
    let token = Token::StartTag {
        name: Arc::from("b"),
        attributes: Vec::new(),
        self_closing: false,
        line: 1,
    };
    b.highlight(&token);
    let ignored = el(&mut b, "b", &[]);
    b.append_to_document(ignored);
    b.report(TreeDiagnostic::StartTagWithoutDoctype, 1);
    b.flush(false).expect("flush");

    let exec = replay(&sink);
    let doc = exec.materialize().expect("materialize");
    assert_eq!(doc.children()[0].element_name(), Some("html"));
    assert_eq!(b.highlighter().expect("highlighter").annotations().len(), 1);
    assert_eq!(b.pending_ops(), 0);
}

#[test]
fn document_state_travels_as_operations_without_a_stage() {
    let sink = Arc::new(Mutex::new(VecOpSink::new()));
    let mut b = TreeBuilder::queued(
        TreeBuilderConfig::default(),
        Some(Box::new(Arc::clone(&sink))),
        None,
    );
    b.set_document_charset(Encoding::Windows1252, CharsetSource::HttpHeader, false);
    b.document_mode(DocumentMode::Quirks);
    let img = el(&mut b, "img", &[("src", "a.png")]);
    b.append_to_document(img);
    assert_eq!(b.pending_loads(), 0);
    assert!(b.flush(false).expect("flush"));

    let exec = replay(&sink);
    assert_eq!(exec.document().mode(), Some(DocumentMode::Quirks));
    assert_eq!(
        exec.charset(),
        Some((Encoding::Windows1252, CharsetSource::HttpHeader))
    );
}

#[test]
fn refused_loads_do_not_break_the_parse() {
    struct Refusing;
    impl SpeculativeLoadStage for Refusing {
        fn move_speculative_loads_from(
            &mut self,
            _loads: Vec<SpeculativeLoad>,
        ) -> Result<(), QueueError> {
            Err(QueueError::SinkClosed)
        }
    }
    for eager in [false, true] {
        let sink = Arc::new(Mutex::new(VecOpSink::new()));
        let mut b = TreeBuilder::queued(
            TreeBuilderConfig {
                eager_speculative_loads: eager,
                ..TreeBuilderConfig::default()
            },
            Some(Box::new(Arc::clone(&sink))),
            Some(Box::new(Refusing)),
        );
        let img = el(&mut b, "img", &[("src", "a.png")]);
        b.append_to_document(img);
        b.document_mode(DocumentMode::Quirks);
        assert_eq!(b.flush(false), Ok(true), "eager: {eager}");
        assert_eq!(b.is_broken(), None, "eager: {eager}");
        assert_eq!(b.pending_loads(), 0);

        let exec = replay(&sink);
        assert_eq!(exec.document().mode(), Some(DocumentMode::Quirks));
        let doc = exec.materialize().expect("materialize");
        assert_eq!(doc.children()[0].element_name(), Some("img"));
    }
}

#[test]
fn charset_reports_are_dropped_in_opless_mode() {
    let mut exec = TreeOpExecutor::new();
    {
        let mut b = TreeBuilder::opless(TreeBuilderConfig::default(), &mut exec);
        b.update_charset_source(CharsetSource::Meta);
        b.maybe_complain_about_charset("EncMetaTooLate", false, 3);
        b.try_to_enable_encoding_menu();
        assert_eq!(b.is_broken(), None);
        assert_eq!(b.suspension(), None);
    }
    assert!(!exec.encoding_menu_enabled());
    assert!(exec.charset_complaints().is_empty());
}

#[test]
fn view_source_flush_keeps_document_level_operations() {
    let (mut b, sink, _) = queued();
    b.enable_view_source(Highlighter::new());
    b.try_to_enable_encoding_menu();
    let ignored = el(&mut b, "b", &[]);
    b.append_to_document(ignored);
    b.stream_ended();
    b.flush(false).expect("flush");

    let ops: Vec<TreeOperation> = batches(&sink).into_iter().flatten().collect();
    assert!(ops.contains(&TreeOperation::EnableEncodingMenu));
    assert_eq!(ops.last(), Some(&TreeOperation::StreamEnded));
    assert!(
        !ops.iter()
            .any(|op| matches!(op, TreeOperation::AppendToDocument { child } if *child == ignored))
    );
}
