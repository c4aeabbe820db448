use std::error::Error;
use std::fs;
use std::path::PathBuf;

use bus::{Bus, CoreCommand, CoreEvent};
use clap::Parser;
use html::{ContentKind, SpeculativeLoad, TreeOpExecutor, content_kind_for, debug};
use runtime_parse::{ParseRuntimeConfig, start_parse_runtime};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const TAB: u64 = 1;
const REQUEST: u64 = 1;
const CHUNK: usize = 4096;

const SAMPLE: &str = "<!DOCTYPE html><html><head><meta charset=utf-8><title>htmlbridge</title>\
<link rel=stylesheet href=site.css></head><body><h1>Hello</h1>\
<p class=lead>Parsed off-thread, replayed <b>here</b>.<img src=logo.png></body></html>";

#[derive(Parser, Debug)]
#[command(name = "htmlbridge", version, about = "Parses HTML off-thread and replays the tree")]
struct Args {
    /// HTML file to parse. A built-in sample is used when omitted.
    #[arg(value_name = "FILE")]
    path: Option<PathBuf>,

    /// Content type of the input (text/html, text/plain, ...).
    #[arg(long = "type", value_name = "content-type", value_parser = parse_content_type)]
    content_type: Option<ContentKind>,

    /// Show highlighted source instead of the document.
    #[arg(long, conflicts_with = "content_type")]
    source: bool,

    /// Maximum number of outline lines to print.
    #[arg(long, value_name = "number", default_value_t = 400)]
    lines: usize,
}

impl Args {
    fn content(&self) -> ContentKind {
        if self.source {
            ContentKind::ViewSource
        } else {
            self.content_type.unwrap_or_default()
        }
    }
}

fn parse_content_type(value: &str) -> Result<ContentKind, String> {
    content_kind_for(Some(value)).ok_or_else(|| format!("unsupported content type {value:?}"))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let content = args.content();
    let bytes = match &args.path {
        Some(path) => fs::read(path)?,
        None => SAMPLE.as_bytes().to_vec(),
    };

    let (bus, cmd_rx) = Bus::new();
    let worker = start_parse_runtime(ParseRuntimeConfig::from_env(), cmd_rx, bus.evt_tx.clone());

    bus.cmd_tx.send(CoreCommand::ParseHtmlStart {
        tab_id: TAB,
        request_id: REQUEST,
        content,
    })?;
    for chunk in bytes.chunks(CHUNK) {
        bus.cmd_tx.send(CoreCommand::ParseHtmlChunk {
            tab_id: TAB,
            request_id: REQUEST,
            bytes: chunk.to_vec(),
        })?;
    }
    bus.cmd_tx.send(CoreCommand::ParseHtmlDone {
        tab_id: TAB,
        request_id: REQUEST,
    })?;

    let mut exec = TreeOpExecutor::new();
    let mut batches = 0usize;
    loop {
        let event = bus.evt_rx.recv()?;
        if event.key() != (TAB, REQUEST) {
            continue;
        }
        match event {
            CoreEvent::TreeOps { ops, .. } => {
                batches += 1;
                let summary = exec.execute(ops)?;
                log::debug!("batch {batches}: {summary:?}");
            }
            CoreEvent::SpeculativeLoads { loads, .. } => {
                for load in &loads {
                    match load {
                        SpeculativeLoad::Fetch(req) => {
                            log::info!("speculative {:?} fetch: {}", req.kind, req.url)
                        }
                        control => exec.apply_control(control),
                    }
                }
            }
            CoreEvent::CharsetSwitch { request, .. } => {
                log::info!("restarting as {}", request.encoding);
                exec = TreeOpExecutor::new();
                batches = 0;
            }
            CoreEvent::ParseBroken { reason, .. } => {
                return Err(format!("parse broken: {reason}").into());
            }
            CoreEvent::ParseDone { .. } => break,
        }
    }
    drop(bus);
    if worker.join().is_err() {
        log::warn!("parse runtime panicked");
    }

    if let Some((encoding, source)) = exec.charset() {
        println!("charset: {encoding} ({source:?})");
    }
    println!("batches: {batches}");
    for line in debug::outline(&exec.materialize()?, args.lines) {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn content_follows_type_and_source_flags() {
        let args = Args::try_parse_from(["htmlbridge", "--type", "text/plain", "a.html"])
            .expect("parse");
        assert_eq!(args.content(), ContentKind::PlainText);
        assert_eq!(args.path, Some(PathBuf::from("a.html")));

        let args = Args::try_parse_from(["htmlbridge", "--source"]).expect("parse");
        assert_eq!(args.content(), ContentKind::ViewSource);
        assert_eq!(args.lines, 400);

        assert!(Args::try_parse_from(["htmlbridge", "--type", "image/png"]).is_err());
        assert!(Args::try_parse_from(["htmlbridge", "--type", "text/html", "--source"]).is_err());
    }
}
