use bus::{CoreCommand, CoreEvent};
use html::{
    BrokenReason, ContentKind, Encoding, Node, TreeOpExecutor, TreeOperation,
};
use runtime_parse::{ParseRuntimeConfig, start_parse_runtime};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

const TAB: u64 = 7;

struct Worker {
    cmd_tx: Sender<CoreCommand>,
    evt_rx: Receiver<CoreEvent>,
}

fn worker(config: ParseRuntimeConfig) -> Worker {
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (evt_tx, evt_rx) = mpsc::channel();
    let _handle = start_parse_runtime(config, cmd_rx, evt_tx);
    Worker { cmd_tx, evt_rx }
}

fn send_document(w: &Worker, request_id: u64, html: &[u8], chunk: usize) {
    w.cmd_tx
        .send(CoreCommand::ParseHtmlStart {
            tab_id: TAB,
            request_id,
            content: ContentKind::Html,
        })
        .expect("start");
    for bytes in html.chunks(chunk) {
        w.cmd_tx
            .send(CoreCommand::ParseHtmlChunk {
                tab_id: TAB,
                request_id,
                bytes: bytes.to_vec(),
            })
            .expect("chunk");
    }
    w.cmd_tx
        .send(CoreCommand::ParseHtmlDone {
            tab_id: TAB,
            request_id,
        })
        .expect("done");
}

/// Owner side: replays events for one request until it completes.
struct Owner {
    exec: TreeOpExecutor,
    batches: usize,
    switches: usize,
    broken: Option<BrokenReason>,
    last_batch: Vec<TreeOperation>,
}

fn collect(w: &Worker, request_id: u64) -> Owner {
    let mut owner = Owner {
        exec: TreeOpExecutor::new(),
        batches: 0,
        switches: 0,
        broken: None,
        last_batch: Vec::new(),
    };
    loop {
        let event = w
            .evt_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("event before timeout");
        if event.key() != (TAB, request_id) {
            continue;
        }
        match event {
            CoreEvent::TreeOps { ops, .. } => {
                owner.batches += 1;
                owner.last_batch = ops.clone();
                owner.exec.execute(ops).expect("replay");
            }
            CoreEvent::SpeculativeLoads { loads, .. } => {
                for load in &loads {
                    owner.exec.apply_control(load);
                }
            }
            CoreEvent::CharsetSwitch { .. } => {
                owner.switches += 1;
                owner.exec = TreeOpExecutor::new();
            }
            CoreEvent::ParseBroken { reason, .. } => {
                owner.broken = Some(reason);
                return owner;
            }
            CoreEvent::ParseDone { .. } => return owner,
        }
    }
}

fn text_of(node: &Node) -> String {
    match node {
        Node::Text { text, .. } => text.clone(),
        other => other.children().iter().map(text_of).collect(),
    }
}

#[test]
fn chunked_document_round_trips_through_the_worker() {
    let w = worker(ParseRuntimeConfig::default());
    let html = b"<!DOCTYPE html><title>t</title><div id=a><p>one<p>two</div><img src=x.png>";
    send_document(&w, 1, html, 5);
    let owner = collect(&w, 1);
    assert_eq!(owner.broken, None);
    assert!(owner.exec.stream_ended());
    let doc = owner.exec.materialize().expect("materialize");
    let body = &doc.children()[0].children()[1];
    let names: Vec<_> = body.children().iter().filter_map(Node::element_name).collect();
    assert_eq!(names, vec!["div", "img"]);
    assert_eq!(text_of(&body.children()[0]), "onetwo");
}

#[test]
fn late_meta_restarts_the_parse_once() {
    let mut config = ParseRuntimeConfig::default();
    config.session.encoding = Encoding::Windows1252;
    let w = worker(config);
    send_document(&w, 2, "<meta charset=utf-8><p>caf\u{e9}".as_bytes(), 4);
    let owner = collect(&w, 2);
    assert_eq!(owner.switches, 1);
    assert_eq!(owner.broken, None);
    let doc = owner.exec.materialize().expect("materialize");
    assert_eq!(text_of(&doc), "café");
    assert_eq!(owner.exec.charset().map(|(e, _)| e), Some(Encoding::Utf8));
}

#[test]
fn op_cap_reports_a_broken_parse() {
    let mut config = ParseRuntimeConfig::default();
    config.session.builder.max_queued_ops = Some(8);
    let w = worker(config);
    send_document(&w, 3, "<div>x</div>".repeat(50).as_bytes(), 64);
    let owner = collect(&w, 3);
    assert_eq!(owner.broken, Some(BrokenReason::OutOfMemory));
    assert!(matches!(
        owner.last_batch.as_slice(),
        [TreeOperation::MarkAsBroken {
            reason: BrokenReason::OutOfMemory
        }]
    ));
    assert_eq!(owner.exec.broken(), Some(BrokenReason::OutOfMemory));
}

#[test]
fn cancelled_parses_go_quiet() {
    let w = worker(ParseRuntimeConfig::default());
    w.cmd_tx
        .send(CoreCommand::ParseHtmlStart {
            tab_id: TAB,
            request_id: 4,
            content: ContentKind::Html,
        })
        .expect("start");
    w.cmd_tx
        .send(CoreCommand::ParseHtmlChunk {
            tab_id: TAB,
            request_id: 4,
            bytes: b"<p>never".to_vec(),
        })
        .expect("chunk");
    w.cmd_tx
        .send(CoreCommand::ParseHtmlCancel {
            tab_id: TAB,
            request_id: 4,
        })
        .expect("cancel");
    w.cmd_tx
        .send(CoreCommand::ParseHtmlDone {
            tab_id: TAB,
            request_id: 4,
        })
        .expect("done");
    send_document(&w, 5, b"<p>after", 64);

    let mut saw_cancelled_done = false;
    loop {
        let event = w
            .evt_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("event before timeout");
        match event {
            CoreEvent::ParseDone { request_id: 4, .. } => saw_cancelled_done = true,
            CoreEvent::ParseDone { request_id: 5, .. } => break,
            _ => {}
        }
    }
    assert!(!saw_cancelled_done);
}
