use std::collections::HashMap;
use std::str::FromStr;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bus::{CoreCommand, CoreEvent};
use core_types::{RequestId, TabId};
use html::{
    BrokenReason, CharsetSource, ContentKind, HtmlParseSession, PumpOutcome, QueueError,
    SessionConfig, SpeculativeLoad, SpeculativeLoadStage, SuspendReason, TreeOpSink,
    TreeOperation,
};

const TICK: Duration = Duration::from_millis(180);

#[derive(Clone, Debug)]
pub struct ParseRuntimeConfig {
    pub session: SessionConfig,
    /// Buffered work older than this is flushed even below the op threshold.
    pub flush_tick: Duration,
    /// Restart a parse once under the encoding a late `<meta>` declares.
    pub allow_charset_restart: bool,
}

impl Default for ParseRuntimeConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            flush_tick: TICK,
            allow_charset_restart: true,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(target: "runtime_parse", "ignoring unparsable {name}={raw:?}");
            None
        }
    }
}

impl ParseRuntimeConfig {
    /// Defaults with `HTMLBRIDGE_FLUSH_OPS`, `HTMLBRIDGE_FLUSH_TICK_MS` and
    /// `HTMLBRIDGE_SPECULATIVE_LOADS` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ops) = env_value::<usize>("HTMLBRIDGE_FLUSH_OPS") {
            config.session.discretionary_flush_ops = ops.max(1);
        }
        if let Some(ms) = env_value::<u64>("HTMLBRIDGE_FLUSH_TICK_MS") {
            config.flush_tick = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("HTMLBRIDGE_SPECULATIVE_LOADS") {
            match raw.trim() {
                "1" | "true" | "on" => config.session.builder.generate_speculative_loads = true,
                "0" | "false" | "off" => config.session.builder.generate_speculative_loads = false,
                other => {
                    log::warn!(target: "runtime_parse", "ignoring HTMLBRIDGE_SPECULATIVE_LOADS={other:?}")
                }
            }
        }
        config
    }
}

type Key = (TabId, RequestId);

/// Sends flushed operation batches to the owner as `CoreEvent::TreeOps`.
struct ChannelOpSink {
    key: Key,
    evt_tx: Sender<CoreEvent>,
}

impl TreeOpSink for ChannelOpSink {
    fn move_ops_from(&mut self, ops: Vec<TreeOperation>) -> Result<(), QueueError> {
        let (tab_id, request_id) = self.key;
        self.evt_tx
            .send(CoreEvent::TreeOps {
                tab_id,
                request_id,
                ops,
            })
            .map_err(|_| QueueError::SinkClosed)
    }
}

struct ChannelLoadStage {
    key: Key,
    evt_tx: Sender<CoreEvent>,
}

impl SpeculativeLoadStage for ChannelLoadStage {
    fn move_speculative_loads_from(
        &mut self,
        loads: Vec<SpeculativeLoad>,
    ) -> Result<(), QueueError> {
        let (tab_id, request_id) = self.key;
        self.evt_tx
            .send(CoreEvent::SpeculativeLoads {
                tab_id,
                request_id,
                loads,
            })
            .map_err(|_| QueueError::SinkClosed)
    }
}

fn new_session(key: Key, config: SessionConfig, evt_tx: &Sender<CoreEvent>) -> HtmlParseSession {
    HtmlParseSession::new(
        config,
        Some(Box::new(ChannelOpSink {
            key,
            evt_tx: evt_tx.clone(),
        })),
        Some(Box::new(ChannelLoadStage {
            key,
            evt_tx: evt_tx.clone(),
        })),
    )
}

struct ParseState {
    session: HtmlParseSession,
    // Kept for a charset restart from byte zero.
    raw: Vec<u8>,
    restarted: bool,
    done: bool,
    last_flush: Instant,
}

enum Drive {
    Keep,
    Remove,
}

struct ParseRuntime {
    config: ParseRuntimeConfig,
    evt_tx: Sender<CoreEvent>,
    parses: HashMap<Key, ParseState>,
}

impl ParseRuntime {
    fn start(&mut self, key: Key, content: ContentKind) {
        let config = SessionConfig {
            content,
            ..self.config.session.clone()
        };
        let state = ParseState {
            session: new_session(key, config, &self.evt_tx),
            raw: Vec::new(),
            restarted: false,
            done: false,
            last_flush: Instant::now(),
        };
        if let Some(mut previous) = self.parses.insert(key, state) {
            log::debug!(target: "runtime_parse", "restarted parse {key:?}; abandoning previous");
            previous.session.abandon();
        }
    }

    fn chunk(&mut self, key: Key, bytes: Vec<u8>) {
        let Some(state) = self.parses.get_mut(&key) else {
            log::debug!(target: "runtime_parse", "chunk for unknown parse {key:?}");
            return;
        };
        if self.config.allow_charset_restart
            && !state.restarted
            && state.session.charset_source().is_tentative()
        {
            state.raw.extend_from_slice(&bytes);
        } else if !state.raw.is_empty() {
            state.raw = Vec::new();
        }
        if let Err(err) = state.session.push_bytes(&bytes) {
            log::warn!(target: "runtime_parse", "parse {key:?}: {err}");
            return;
        }
        self.drive(key);
    }

    fn done(&mut self, key: Key) {
        let Some(state) = self.parses.get_mut(&key) else {
            log::debug!(target: "runtime_parse", "done for unknown parse {key:?}");
            return;
        };
        state.done = true;
        state.session.finish();
        self.drive(key);
    }

    fn cancel(&mut self, key: Key) {
        if let Some(mut state) = self.parses.remove(&key) {
            state.session.abandon();
            log::debug!(target: "runtime_parse", "cancelled parse {key:?}");
        }
    }

    fn drive(&mut self, key: Key) {
        let Some(state) = self.parses.get_mut(&key) else {
            return;
        };
        let outcome = pump_until_blocked(key, state, &self.config, &self.evt_tx);
        if let Drive::Remove = outcome {
            self.parses.remove(&key);
        }
    }

    /// Discretionary flush of every parse whose buffered work is older than a tick.
    fn tick(&mut self) {
        let tick = self.config.flush_tick;
        for (key, state) in self.parses.iter_mut() {
            if state.last_flush.elapsed() < tick {
                continue;
            }
            state.last_flush = Instant::now();
            if let Err(err) = state.session.flush(true) {
                log::warn!(target: "runtime_parse", "parse {key:?}: tick flush failed: {err}");
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, mut state) in self.parses.drain() {
            state.session.abandon();
        }
    }
}

fn report_broken(key: Key, reason: BrokenReason, evt_tx: &Sender<CoreEvent>) {
    let (tab_id, request_id) = key;
    log::warn!(target: "runtime_parse", "parse {key:?} broken: {reason}");
    let _ = evt_tx.send(CoreEvent::ParseBroken {
        tab_id,
        request_id,
        reason,
    });
}

fn pump_until_blocked(
    key: Key,
    state: &mut ParseState,
    config: &ParseRuntimeConfig,
    evt_tx: &Sender<CoreEvent>,
) -> Drive {
    let (tab_id, request_id) = key;
    loop {
        let outcome = match state.session.pump() {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = state
                    .session
                    .builder()
                    .is_broken()
                    .unwrap_or(BrokenReason::SinkClosed);
                log::warn!(target: "runtime_parse", "parse {key:?}: {err}");
                report_broken(key, reason, evt_tx);
                return Drive::Remove;
            }
        };
        match outcome {
            PumpOutcome::NeedsInput => {
                if state.last_flush.elapsed() >= config.flush_tick {
                    state.last_flush = Instant::now();
                    if let Err(err) = state.session.flush(true) {
                        log::warn!(target: "runtime_parse", "parse {key:?}: flush failed: {err}");
                        continue;
                    }
                }
                return Drive::Keep;
            }
            // No script engine here: the batch ending in the script has been
            // flushed, so parsing simply resumes.
            PumpOutcome::Suspended(SuspendReason::Script) => {
                state.last_flush = Instant::now();
            }
            PumpOutcome::Suspended(SuspendReason::CharsetSwitch) => {
                let Some(request) = state.session.take_charset_switch() else {
                    continue;
                };
                if !config.allow_charset_restart || state.restarted {
                    log::debug!(target: "runtime_parse", "parse {key:?}: charset switch to {} declined", request.encoding);
                    continue;
                }
                state.session.discard_for_restart();
                log::debug!(target: "runtime_parse", "parse {key:?}: restarting as {}", request.encoding);
                let _ = evt_tx.send(CoreEvent::CharsetSwitch {
                    tab_id,
                    request_id,
                    request,
                });
                let session_config = SessionConfig {
                    encoding: request.encoding,
                    charset_source: request.source.max(CharsetSource::Meta),
                    ..state.session.config().clone()
                };
                state.session.abandon();
                state.session = new_session(key, session_config, evt_tx);
                state.restarted = true;
                let raw = std::mem::take(&mut state.raw);
                if let Err(err) = state.session.push_bytes(&raw) {
                    log::warn!(target: "runtime_parse", "parse {key:?}: {err}");
                }
                if state.done {
                    state.session.finish();
                }
            }
            PumpOutcome::Suspended(SuspendReason::Broken) => {
                let reason = state
                    .session
                    .builder()
                    .is_broken()
                    .unwrap_or(BrokenReason::SinkClosed);
                report_broken(key, reason, evt_tx);
                return Drive::Remove;
            }
            PumpOutcome::Finished => {
                log::debug!(target: "runtime_parse", "parse {key:?} done");
                let _ = evt_tx.send(CoreEvent::ParseDone { tab_id, request_id });
                return Drive::Remove;
            }
        }
    }
}

/// Spawns the parser worker. It runs until the command channel closes.
pub fn start_parse_runtime(
    config: ParseRuntimeConfig,
    cmd_rx: Receiver<CoreCommand>,
    evt_tx: Sender<CoreEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let tick = config.flush_tick.max(Duration::from_millis(1));
        let mut runtime = ParseRuntime {
            config,
            evt_tx,
            parses: HashMap::new(),
        };
        loop {
            let cmd = match cmd_rx.recv_timeout(tick) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    runtime.tick();
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match cmd {
                CoreCommand::ParseHtmlStart {
                    tab_id,
                    request_id,
                    content,
                } => runtime.start((tab_id, request_id), content),
                CoreCommand::ParseHtmlChunk {
                    tab_id,
                    request_id,
                    bytes,
                } => runtime.chunk((tab_id, request_id), bytes),
                CoreCommand::ParseHtmlDone { tab_id, request_id } => {
                    runtime.done((tab_id, request_id))
                }
                CoreCommand::ParseHtmlCancel { tab_id, request_id } => {
                    runtime.cancel((tab_id, request_id))
                }
            }
        }
        runtime.shutdown();
        log::debug!(target: "runtime_parse", "command channel closed; parse runtime stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_values_parse_or_fall_back() {
        assert_eq!(env_value::<usize>("HTMLBRIDGE_TEST_UNSET_VALUE"), None);
        let config = ParseRuntimeConfig::default();
        assert_eq!(config.flush_tick, Duration::from_millis(180));
        assert!(config.allow_charset_restart);
    }

    fn runtime(charset_source: CharsetSource) -> (ParseRuntime, Receiver<CoreEvent>) {
        let (evt_tx, evt_rx) = std::sync::mpsc::channel();
        let mut config = ParseRuntimeConfig::default();
        config.session.charset_source = charset_source;
        let runtime = ParseRuntime {
            config,
            evt_tx,
            parses: HashMap::new(),
        };
        (runtime, evt_rx)
    }

    #[test]
    fn raw_bytes_are_kept_only_while_a_restart_is_possible() {
        let key = (1, 1);
        let (mut tentative, _events) = runtime(CharsetSource::Fallback);
        tentative.start(key, ContentKind::Html);
        tentative.chunk(key, b"<p>one".to_vec());
        assert_eq!(tentative.parses[&key].raw, b"<p>one");

        let (mut fixed, _events) = runtime(CharsetSource::HttpHeader);
        fixed.start(key, ContentKind::Html);
        fixed.chunk(key, b"<p>one".to_vec());
        assert!(fixed.parses[&key].raw.is_empty());
    }

    #[test]
    fn confirmed_encoding_releases_raw_bytes() {
        let key = (1, 2);
        let (mut rt, _events) = runtime(CharsetSource::Fallback);
        rt.start(key, ContentKind::Html);
        rt.chunk(key, b"<meta charset=utf-8>".to_vec());
        assert_eq!(rt.parses[&key].session.charset_source(), CharsetSource::Meta);
        rt.chunk(key, b"<p>two".to_vec());
        assert!(rt.parses[&key].raw.is_empty());
    }
}
