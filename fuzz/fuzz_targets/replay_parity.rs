#![no_main]

use std::sync::{Arc, Mutex};

use html::{
    HtmlParseSession, PumpOutcome, SessionConfig, Tokenizer, TreeBuilder, TreeBuilderConfig,
    TreeConstructor, TreeOpExecutor, VecLoadStage, VecOpSink,
};
use libfuzzer_sys::fuzz_target;

// First byte picks the chunk size; the rest is the document.
fuzz_target!(|data: &[u8]| {
    let Some((&chunk, rest)) = data.split_first() else {
        return;
    };
    let input = String::from_utf8_lossy(rest);

    let mut opless = TreeOpExecutor::new();
    {
        let mut builder = TreeBuilder::opless(TreeBuilderConfig::default(), &mut opless);
        let mut constructor = TreeConstructor::new();
        let mut tokenizer = Tokenizer::new();
        tokenizer.feed(&input);
        tokenizer.end();
        while let Some(token) = tokenizer.next_token() {
            constructor.process(token, &mut builder);
            if builder.is_plain_text() {
                tokenizer.set_plain_text();
            }
        }
        if builder.is_broken().is_some() {
            return;
        }
    }

    let sink = Arc::new(Mutex::new(VecOpSink::new()));
    let stage = Arc::new(Mutex::new(VecLoadStage::default()));
    let mut session = HtmlParseSession::new(
        SessionConfig::default(),
        Some(Box::new(Arc::clone(&sink))),
        Some(Box::new(Arc::clone(&stage))),
    );
    let mut finished = false;
    let pieces = input.as_bytes().chunks(usize::from(chunk).max(1));
    for bytes in pieces.map(Some).chain(std::iter::once(None)) {
        match bytes {
            Some(bytes) => session.push_bytes(bytes).expect("push"),
            None => session.finish(),
        }
        loop {
            match session.pump().expect("pump") {
                PumpOutcome::NeedsInput => break,
                PumpOutcome::Finished => {
                    finished = true;
                    break;
                }
                PumpOutcome::Suspended(_) => {}
            }
        }
    }
    assert!(finished);

    let mut queued = TreeOpExecutor::new();
    for load in &stage.lock().expect("stage").loads {
        queued.apply_control(load);
    }
    let ops = sink.lock().expect("sink").take_ops();
    queued.execute(ops).expect("replay");
    assert_eq!(
        queued.materialize().expect("queued tree"),
        opless.materialize().expect("opless tree")
    );
});
