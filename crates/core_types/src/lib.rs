pub type TabId = u64;
pub type RequestId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Html,
    Css,
    Image,
    Script,
    Font,
    Media,
    Fetch,
    Other,
}

impl ResourceKind {
    /// Maps a `<link rel=preload as=...>` destination to a resource kind.
    pub fn from_preload_destination(value: &str) -> Option<Self> {
        let value = value.trim();
        let kind = if value.eq_ignore_ascii_case("script") {
            ResourceKind::Script
        } else if value.eq_ignore_ascii_case("style") {
            ResourceKind::Css
        } else if value.eq_ignore_ascii_case("image") {
            ResourceKind::Image
        } else if value.eq_ignore_ascii_case("font") {
            ResourceKind::Font
        } else if value.eq_ignore_ascii_case("audio") || value.eq_ignore_ascii_case("video") {
            ResourceKind::Media
        } else if value.eq_ignore_ascii_case("fetch") {
            ResourceKind::Fetch
        } else if value.eq_ignore_ascii_case("document") {
            ResourceKind::Html
        } else {
            return None;
        };
        Some(kind)
    }

    pub fn default_priority(self) -> LoadPriority {
        match self {
            ResourceKind::Html | ResourceKind::Css => LoadPriority::High,
            ResourceKind::Script | ResourceKind::Font | ResourceKind::Fetch => LoadPriority::High,
            ResourceKind::Image | ResourceKind::Other => LoadPriority::Low,
            ResourceKind::Media => LoadPriority::Lowest,
        }
    }
}

/// Fetch priority hint carried by speculative loads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPriority {
    Lowest,
    Low,
    Normal,
    High,
}

impl LoadPriority {
    /// Applies a `fetchpriority` attribute value on top of a default.
    pub fn with_hint(self, hint: Option<&str>) -> Self {
        match hint.map(str::trim) {
            Some(h) if h.eq_ignore_ascii_case("high") => LoadPriority::High,
            Some(h) if h.eq_ignore_ascii_case("low") => LoadPriority::Low,
            _ => self,
        }
    }
}
