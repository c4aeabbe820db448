//! Non-fatal markup diagnostics raised by tree construction.
//!
//! Each variant names one class of malformed markup. Reporting a diagnostic
//! never changes parser state; consumers treat them as console telemetry.

use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeDiagnostic {
    DeepTree,
    StrayStartTag(Arc<str>),
    StrayEndTag(Arc<str>),
    UnclosedElements(Arc<str>),
    UnclosedElementsImplied(Arc<str>),
    UnclosedElementsCell,
    StrayDoctype,
    AlmostStandardsDoctype,
    QuirkyDoctype,
    NonSpaceInTrailer,
    NonSpaceAfterFrameset,
    NonSpaceInFrameset,
    NonSpaceAfterBody,
    NonSpaceInColgroupInFragment,
    NonSpaceInNoscriptInHead,
    FooBetweenHeadAndBody(Arc<str>),
    StartTagWithoutDoctype,
    NoSelectInTableScope,
    StartSelectWhereEndSelectExpected,
    StartTagWithSelectOpen(Arc<str>),
    BadStartTagInNoscriptInHead(Arc<str>),
    Image,
    FooSeenWhenFooOpen(Arc<str>),
    HeadingWhenHeadingOpen,
    FramesetStart,
    NoCellToClose,
    StartTagInTable(Arc<str>),
    FormWhenFormOpen,
    TableSeenWhileTableOpen,
    StartTagInTableBody(Arc<str>),
    EndTagSeenWithoutDoctype,
    EndTagAfterBody,
    EndTagSeenWithSelectOpen(Arc<str>),
    GarbageInColgroup,
    EndTagBr,
    NoElementToCloseButEndTagSeen(Arc<str>),
    HtmlStartTagInForeignContext(Arc<str>),
    NoTableRowToClose,
    NonSpaceInTable,
    UnclosedChildrenInRuby,
    StartTagSeenWithoutRuby(Arc<str>),
    SelfClosing,
    NoCheckUnclosedElementsOnStack,
    EndTagDidNotMatchCurrentOpenElement { name: Arc<str>, open: Arc<str> },
    EndTagViolatesNestingRules(Arc<str>),
    EndWithUnclosedElements(Arc<str>),
}

impl TreeDiagnostic {
    /// Stable identifier, suitable as a localization key.
    pub fn id(&self) -> &'static str {
        use TreeDiagnostic::*;
        match self {
            DeepTree => "errDeepTree",
            StrayStartTag(_) => "errStrayStartTag",
            StrayEndTag(_) => "errStrayEndTag",
            UnclosedElements(_) => "errUnclosedElements",
            UnclosedElementsImplied(_) => "errUnclosedElementsImplied",
            UnclosedElementsCell => "errUnclosedElementsCell",
            StrayDoctype => "errStrayDoctype",
            AlmostStandardsDoctype => "errAlmostStandardsDoctype",
            QuirkyDoctype => "errQuirkyDoctype",
            NonSpaceInTrailer => "errNonSpaceInTrailer",
            NonSpaceAfterFrameset => "errNonSpaceAfterFrameset",
            NonSpaceInFrameset => "errNonSpaceInFrameset",
            NonSpaceAfterBody => "errNonSpaceAfterBody",
            NonSpaceInColgroupInFragment => "errNonSpaceInColgroupInFragment",
            NonSpaceInNoscriptInHead => "errNonSpaceInNoscriptInHead",
            FooBetweenHeadAndBody(_) => "errFooBetweenHeadAndBody",
            StartTagWithoutDoctype => "errStartTagWithoutDoctype",
            NoSelectInTableScope => "errNoSelectInTableScope",
            StartSelectWhereEndSelectExpected => "errStartSelectWhereEndSelectExpected",
            StartTagWithSelectOpen(_) => "errStartTagWithSelectOpen",
            BadStartTagInNoscriptInHead(_) => "errBadStartTagInNoscriptInHead",
            Image => "errImage",
            FooSeenWhenFooOpen(_) => "errFooSeenWhenFooOpen",
            HeadingWhenHeadingOpen => "errHeadingWhenHeadingOpen",
            FramesetStart => "errFramesetStart",
            NoCellToClose => "errNoCellToClose",
            StartTagInTable(_) => "errStartTagInTable",
            FormWhenFormOpen => "errFormWhenFormOpen",
            TableSeenWhileTableOpen => "errTableSeenWhileTableOpen",
            StartTagInTableBody(_) => "errStartTagInTableBody",
            EndTagSeenWithoutDoctype => "errEndTagSeenWithoutDoctype",
            EndTagAfterBody => "errEndTagAfterBody",
            EndTagSeenWithSelectOpen(_) => "errEndTagSeenWithSelectOpen",
            GarbageInColgroup => "errGarbageInColgroup",
            EndTagBr => "errEndTagBr",
            NoElementToCloseButEndTagSeen(_) => "errNoElementToCloseButEndTagSeen",
            HtmlStartTagInForeignContext(_) => "errHtmlStartTagInForeignContext",
            NoTableRowToClose => "errNoTableRowToClose",
            NonSpaceInTable => "errNonSpaceInTable",
            UnclosedChildrenInRuby => "errUnclosedChildrenInRuby",
            StartTagSeenWithoutRuby(_) => "errStartTagSeenWithoutRuby",
            SelfClosing => "errSelfClosing",
            NoCheckUnclosedElementsOnStack => "errNoCheckUnclosedElementsOnStack",
            EndTagDidNotMatchCurrentOpenElement { .. } => "errEndTagDidNotMatchCurrentOpenElement",
            EndTagViolatesNestingRules(_) => "errEndTagViolatesNestingRules",
            EndWithUnclosedElements(_) => "errEndWithUnclosedElements",
        }
    }

    /// Tag name the diagnostic is about, if any.
    pub fn subject(&self) -> Option<&str> {
        use TreeDiagnostic::*;
        match self {
            StrayStartTag(n)
            | StrayEndTag(n)
            | UnclosedElements(n)
            | UnclosedElementsImplied(n)
            | FooBetweenHeadAndBody(n)
            | StartTagWithSelectOpen(n)
            | BadStartTagInNoscriptInHead(n)
            | FooSeenWhenFooOpen(n)
            | StartTagInTable(n)
            | StartTagInTableBody(n)
            | EndTagSeenWithSelectOpen(n)
            | NoElementToCloseButEndTagSeen(n)
            | HtmlStartTagInForeignContext(n)
            | StartTagSeenWithoutRuby(n)
            | EndTagViolatesNestingRules(n)
            | EndWithUnclosedElements(n)
            | EndTagDidNotMatchCurrentOpenElement { name: n, .. } => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for TreeDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.subject()) {
            (TreeDiagnostic::EndTagDidNotMatchCurrentOpenElement { name, open }, _) => {
                write!(f, "{} ({name} vs. open {open})", self.id())
            }
            (_, Some(subject)) => write!(f, "{} ({subject})", self.id()),
            (_, None) => f.write_str(self.id()),
        }
    }
}

/// Receives diagnostics; fire-and-forget.
pub trait DiagnosticsSink: Send {
    fn report(&mut self, diagnostic: &TreeDiagnostic, line: u32);
}

/// Default sink: forwards to the `log` facade.
#[derive(Debug, Default)]
pub struct LogDiagnostics;

impl DiagnosticsSink for LogDiagnostics {
    fn report(&mut self, diagnostic: &TreeDiagnostic, line: u32) {
        log::debug!(target: "html.tree_builder", "line {line}: {diagnostic}");
    }
}

/// Sink that keeps everything, for tests and tooling.
#[derive(Debug, Default)]
pub struct CollectDiagnostics {
    pub reported: Vec<(TreeDiagnostic, u32)>,
}

impl DiagnosticsSink for CollectDiagnostics {
    fn report(&mut self, diagnostic: &TreeDiagnostic, line: u32) {
        self.reported.push((diagnostic.clone(), line));
    }
}

/// Shares one collector between a builder and the code inspecting it.
impl DiagnosticsSink for std::sync::Arc<std::sync::Mutex<CollectDiagnostics>> {
    fn report(&mut self, diagnostic: &TreeDiagnostic, line: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.report(diagnostic, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_subject() {
        let d = TreeDiagnostic::StrayEndTag(Arc::from("p"));
        assert_eq!(d.to_string(), "errStrayEndTag (p)");
        assert_eq!(TreeDiagnostic::SelfClosing.to_string(), "errSelfClosing");
        let m = TreeDiagnostic::EndTagDidNotMatchCurrentOpenElement {
            name: Arc::from("b"),
            open: Arc::from("i"),
        };
        assert_eq!(m.subject(), Some("b"));
        assert!(m.to_string().contains("open i"));
    }
}
