#![no_main]

use std::sync::{Arc, Mutex};

use html::{
    BrokenReason, Encoding, HtmlParseSession, PumpOutcome, SessionConfig, SuspendReason,
    TreeOpExecutor, TreeOperation, VecOpSink,
};
use libfuzzer_sys::fuzz_target;

// Raw bytes under a tentative legacy encoding and a small op cap: the session
// must either finish or break cleanly, and whatever it flushed must replay.
fuzz_target!(|data: &[u8]| {
    let Some((&knobs, rest)) = data.split_first() else {
        return;
    };
    let mut config = SessionConfig {
        encoding: if knobs & 1 == 0 {
            Encoding::Utf8
        } else {
            Encoding::Windows1252
        },
        discretionary_flush_ops: usize::from(knobs >> 4).max(1),
        ..SessionConfig::default()
    };
    config.builder.max_queued_ops = Some(usize::from(knobs >> 1 & 0x7) * 64 + 16);

    let sink = Arc::new(Mutex::new(VecOpSink::new()));
    let mut session = HtmlParseSession::new(config, Some(Box::new(Arc::clone(&sink))), None);
    let mut broken = false;
    let mut reported_broken = false;
    'feed: for bytes in rest.chunks(7).map(Some).chain(std::iter::once(None)) {
        match bytes {
            Some(bytes) => {
                if session.push_bytes(bytes).is_err() {
                    broken = true;
                    break;
                }
            }
            None => session.finish(),
        }
        loop {
            match session.pump() {
                Ok(PumpOutcome::NeedsInput) => break,
                Ok(PumpOutcome::Finished) => break 'feed,
                Ok(PumpOutcome::Suspended(SuspendReason::Script)) => {}
                Ok(PumpOutcome::Suspended(SuspendReason::CharsetSwitch)) => {
                    let _ = session.take_charset_switch();
                }
                Ok(PumpOutcome::Suspended(SuspendReason::Broken)) => {
                    reported_broken = true;
                    broken = true;
                    break 'feed;
                }
                Err(_) => {
                    broken = true;
                    break 'feed;
                }
            }
        }
    }

    let ops = sink.lock().expect("sink").take_ops();
    if reported_broken {
        let reason = session.builder().is_broken();
        assert!(reason.is_some_and(|r| r != BrokenReason::SinkClosed));
        assert!(matches!(ops.last(), Some(TreeOperation::MarkAsBroken { .. })));
    }
    let mut exec = TreeOpExecutor::new();
    if exec.execute(ops).is_ok() && !broken {
        assert!(exec.stream_ended());
    }
});
