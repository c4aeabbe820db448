//! Speculative loads: subresource fetches discovered before their node exists.
//!
//! Entries travel in their own queue, separately from tree operations, and are
//! handed to a resource-loading stage. The same queue carries a few control
//! entries (document charset, document mode, base URL) that the owner needs
//! before the bulk of the tree arrives.

use core_types::{LoadPriority, ResourceKind};
use url::Url;

use crate::charset::{CharsetSource, Encoding};
use crate::op_queue::QueueError;
use crate::tree_op::TreeOperation;
use crate::types::{Attribute, DocumentMode, attribute_value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub url: String,
    pub kind: ResourceKind,
    pub priority: LoadPriority,
    pub crossorigin: Option<String>,
    pub integrity: Option<String>,
    pub module: bool,
    pub async_or_defer: bool,
}

impl LoadRequest {
    pub fn new(url: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            url: url.into(),
            kind,
            priority: kind.default_priority(),
            crossorigin: None,
            integrity: None,
            module: false,
            async_or_defer: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpeculativeLoad {
    Fetch(LoadRequest),
    SetBaseUrl(String),
    SetReferrerPolicy(String),
    SetDocumentCharset {
        encoding: Encoding,
        source: CharsetSource,
        commit_encoding_speculation: bool,
    },
    SetDocumentMode(DocumentMode),
}

impl SpeculativeLoad {
    pub fn is_fetch(&self) -> bool {
        matches!(self, SpeculativeLoad::Fetch(_))
    }

    /// The tree operation carrying this control entry when no stage takes it.
    pub fn control_operation(&self) -> Option<TreeOperation> {
        match self {
            SpeculativeLoad::SetDocumentCharset {
                encoding, source, ..
            } => Some(TreeOperation::SetDocumentCharset {
                encoding: *encoding,
                source: *source,
            }),
            SpeculativeLoad::SetDocumentMode(mode) => {
                Some(TreeOperation::SetDocumentMode { mode: *mode })
            }
            SpeculativeLoad::Fetch(_)
            | SpeculativeLoad::SetBaseUrl(_)
            | SpeculativeLoad::SetReferrerPolicy(_) => None,
        }
    }
}

/// Receives drained speculative-load batches.
pub trait SpeculativeLoadStage: Send {
    fn move_speculative_loads_from(&mut self, loads: Vec<SpeculativeLoad>)
    -> Result<(), QueueError>;
}

#[derive(Debug, Default)]
pub struct VecLoadStage {
    pub loads: Vec<SpeculativeLoad>,
    pub deliveries: usize,
}

impl SpeculativeLoadStage for VecLoadStage {
    fn move_speculative_loads_from(
        &mut self,
        mut loads: Vec<SpeculativeLoad>,
    ) -> Result<(), QueueError> {
        self.deliveries += 1;
        self.loads.append(&mut loads);
        Ok(())
    }
}

impl<S: SpeculativeLoadStage> SpeculativeLoadStage for std::sync::Arc<std::sync::Mutex<S>> {
    fn move_speculative_loads_from(
        &mut self,
        loads: Vec<SpeculativeLoad>,
    ) -> Result<(), QueueError> {
        self.lock()
            .map_err(|_| QueueError::SinkClosed)?
            .move_speculative_loads_from(loads)
    }
}

#[derive(Debug, Default)]
pub struct SpeculativeLoadQueue {
    loads: Vec<SpeculativeLoad>,
}

impl SpeculativeLoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, load: SpeculativeLoad) -> Result<(), QueueError> {
        let requested = self.loads.len() + 1;
        self.loads
            .try_reserve(1)
            .map_err(|_| QueueError::OutOfMemory { requested })?;
        self.loads.push(load);
        Ok(())
    }

    pub fn take(&mut self) -> Vec<SpeculativeLoad> {
        std::mem::take(&mut self.loads)
    }

    pub fn clear(&mut self) {
        self.loads.clear();
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }
}

/// Tracks what the element stream has revealed so far that affects which
/// speculative loads are still safe to start.
#[derive(Debug, Default)]
pub(crate) struct LoadScanner {
    has_seen_import_map: bool,
}

impl LoadScanner {
    /// Speculative loads implied by a newly created element, in discovery order.
    pub(crate) fn scan(&mut self, name: &str, attributes: &[Attribute]) -> Vec<SpeculativeLoad> {
        let attr = |n: &str| attribute_value(attributes, n).map(str::trim);
        let hint = attr("fetchpriority");
        let mut out = Vec::new();
        match name {
            "img" => {
                let url = attr("src")
                    .filter(|s| !s.is_empty())
                    .or_else(|| attr("srcset").and_then(first_srcset_candidate));
                if let Some(url) = url {
                    let mut req = LoadRequest::new(url, ResourceKind::Image);
                    req.priority = req.priority.with_hint(hint);
                    req.crossorigin = attr("crossorigin").map(str::to_string);
                    out.push(SpeculativeLoad::Fetch(req));
                }
            }
            "video" => {
                if let Some(poster) = attr("poster").filter(|s| !s.is_empty()) {
                    out.push(SpeculativeLoad::Fetch(LoadRequest::new(
                        poster,
                        ResourceKind::Image,
                    )));
                }
            }
            "script" => {
                let script_type = attr("type").unwrap_or("");
                if script_type.eq_ignore_ascii_case("importmap") {
                    self.has_seen_import_map = true;
                    return out;
                }
                let module = script_type.eq_ignore_ascii_case("module");
                if module && self.has_seen_import_map {
                    return out;
                }
                if let Some(src) = attr("src").filter(|s| !s.is_empty()) {
                    let mut req = LoadRequest::new(src, ResourceKind::Script);
                    req.module = module;
                    req.async_or_defer = attr("async").is_some() || attr("defer").is_some();
                    if req.async_or_defer {
                        req.priority = LoadPriority::Normal;
                    }
                    req.priority = req.priority.with_hint(hint);
                    req.crossorigin = attr("crossorigin").map(str::to_string);
                    req.integrity = attr("integrity").map(str::to_string);
                    out.push(SpeculativeLoad::Fetch(req));
                }
            }
            "link" => {
                let rel = attr("rel").unwrap_or("");
                let has_rel = |token: &str| {
                    rel.split_ascii_whitespace()
                        .any(|t| t.eq_ignore_ascii_case(token))
                };
                let Some(href) = attr("href").filter(|s| !s.is_empty()) else {
                    return out;
                };
                let kind = if has_rel("stylesheet") {
                    Some(ResourceKind::Css)
                } else if has_rel("modulepreload") {
                    if self.has_seen_import_map {
                        None
                    } else {
                        Some(ResourceKind::Script)
                    }
                } else if has_rel("preload") {
                    attr("as").and_then(ResourceKind::from_preload_destination)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    let mut req = LoadRequest::new(href, kind);
                    req.module = has_rel("modulepreload");
                    req.priority = req.priority.with_hint(hint);
                    req.crossorigin = attr("crossorigin").map(str::to_string);
                    req.integrity = attr("integrity").map(str::to_string);
                    out.push(SpeculativeLoad::Fetch(req));
                }
            }
            "base" => {
                if let Some(href) = attr("href") {
                    out.push(SpeculativeLoad::SetBaseUrl(href.to_string()));
                }
            }
            "meta" => {
                let is_referrer = attr("name").is_some_and(|n| n.eq_ignore_ascii_case("referrer"));
                if let (true, Some(content)) = (is_referrer, attr("content")) {
                    out.push(SpeculativeLoad::SetReferrerPolicy(content.to_string()));
                }
            }
            _ => {}
        }
        out
    }
}

fn first_srcset_candidate(srcset: &str) -> Option<&str> {
    srcset
        .split(',')
        .next()
        .and_then(|candidate| candidate.split_ascii_whitespace().next())
        .filter(|s| !s.is_empty())
}

/// Resolves a load against the current base URL, the way the loading stage
/// does before fetching. `base` tracks `SetBaseUrl` entries as they arrive.
pub fn resolve_load_url(base: &Url, request: &LoadRequest) -> Option<Url> {
    base.join(&request.url).ok()
}

/// Owner-side view of the speculative-load stream: applies control entries
/// and resolves fetches to absolute URLs.
#[derive(Debug)]
pub struct LoadResolver {
    document_url: Url,
    base: Url,
    pub referrer_policy: Option<String>,
}

impl LoadResolver {
    pub fn new(document_url: Url) -> Self {
        Self {
            base: document_url.clone(),
            document_url,
            referrer_policy: None,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Returns the absolute URL for fetch entries; control entries update state.
    pub fn accept(&mut self, load: &SpeculativeLoad) -> Option<(Url, LoadRequest)> {
        match load {
            SpeculativeLoad::Fetch(req) => match resolve_load_url(&self.base, req) {
                Some(url) => Some((url, req.clone())),
                None => {
                    log::debug!(target: "html.speculative", "unresolvable speculative url {:?}", req.url);
                    None
                }
            },
            SpeculativeLoad::SetBaseUrl(href) => {
                match self.document_url.join(href) {
                    Ok(base) => self.base = base,
                    Err(err) => {
                        log::debug!(target: "html.speculative", "ignoring base href {href:?}: {err}")
                    }
                }
                None
            }
            SpeculativeLoad::SetReferrerPolicy(policy) => {
                self.referrer_policy = Some(policy.clone());
                None
            }
            SpeculativeLoad::SetDocumentCharset { .. } | SpeculativeLoad::SetDocumentMode(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Vec<Attribute> {
        pairs.iter().map(|(k, v)| Attribute::new(*k, *v)).collect()
    }

    fn fetch(load: &SpeculativeLoad) -> &LoadRequest {
        match load {
            SpeculativeLoad::Fetch(req) => req,
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    #[test]
    fn image_and_script_discovery() {
        let mut scanner = LoadScanner::default();
        let img = scanner.scan("img", &attrs(&[("src", "a.png"), ("fetchpriority", "high")]));
        assert_eq!(fetch(&img[0]).kind, ResourceKind::Image);
        assert_eq!(fetch(&img[0]).priority, LoadPriority::High);

        let srcset = scanner.scan("img", &attrs(&[("srcset", "small.png 1x, big.png 2x")]));
        assert_eq!(fetch(&srcset[0]).url, "small.png");

        let script = scanner.scan("script", &attrs(&[("src", "app.js"), ("defer", "")]));
        let req = fetch(&script[0]);
        assert!(req.async_or_defer);
        assert_eq!(req.priority, LoadPriority::Normal);

        assert!(scanner.scan("script", &[]).is_empty());
        assert!(scanner.scan("div", &attrs(&[("src", "x")])).is_empty());
    }

    #[test]
    fn import_map_stops_module_preloads() {
        let mut scanner = LoadScanner::default();
        let module = attrs(&[("type", "module"), ("src", "m.js")]);
        assert_eq!(scanner.scan("script", &module).len(), 1);
        assert!(scanner.scan("script", &attrs(&[("type", "importmap")])).is_empty());
        assert!(scanner.scan("script", &module).is_empty());
        assert!(scanner
            .scan("link", &attrs(&[("rel", "modulepreload"), ("href", "m.js")]))
            .is_empty());
        let classic = scanner.scan("script", &attrs(&[("src", "c.js")]));
        assert_eq!(classic.len(), 1);
    }

    #[test]
    fn link_relations() {
        let mut scanner = LoadScanner::default();
        let css = scanner.scan("link", &attrs(&[("rel", "Stylesheet"), ("href", "s.css")]));
        assert_eq!(fetch(&css[0]).kind, ResourceKind::Css);
        let font = scanner.scan(
            "link",
            &attrs(&[("rel", "preload"), ("as", "font"), ("href", "f.woff2")]),
        );
        assert_eq!(fetch(&font[0]).kind, ResourceKind::Font);
        assert!(scanner
            .scan("link", &attrs(&[("rel", "preload"), ("href", "x")]))
            .is_empty());
        assert!(scanner.scan("link", &attrs(&[("rel", "icon"), ("href", "i.ico")])).is_empty());
    }

    #[test]
    fn resolver_tracks_base_url() {
        let doc = Url::parse("https://example.com/dir/page.html").expect("url");
        let mut resolver = LoadResolver::new(doc);
        let img = SpeculativeLoad::Fetch(LoadRequest::new("a.png", ResourceKind::Image));
        let (url, _) = resolver.accept(&img).expect("resolved");
        assert_eq!(url.as_str(), "https://example.com/dir/a.png");

        assert!(resolver
            .accept(&SpeculativeLoad::SetBaseUrl("/static/".to_string()))
            .is_none());
        let (url, _) = resolver.accept(&img).expect("resolved");
        assert_eq!(url.as_str(), "https://example.com/static/a.png");
    }
}
