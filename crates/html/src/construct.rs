//! Simplified tree construction.
//!
//! Decides what to build from the token stream and tells the [`TreeBuilder`];
//! it never sees nodes, only handles. Covers the insertion modes a document
//! needs to reach its body (initial, before html/head, in head, after head,
//! in body, text, after body), the quirks decision, implied elements,
//! templates and declarative shadow roots, the form pointer, heading and
//! paragraph nesting, and encoding declarations in `<meta>`.
//!
//! Known limitations (intentional):
//! - No table, select or foreign-content insertion modes and no adoption
//!   agency; misnested formatting elements are closed, not reconstructed.
//! - No foster parenting.

use std::sync::Arc;

use crate::charset::charset_from_content_type;
use crate::diagnostics::TreeDiagnostic;
use crate::handles::ContentHandle;
use crate::tree_builder::TreeBuilder;
use crate::tree_op::{ShadowRootInit, ShadowRootMode};
use crate::types::{Attribute, Doctype, DocumentMode, Token, attribute_value};

/// Elements nested deeper than this are attached to the element at this depth.
pub const MAX_TREE_DEPTH: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertionMode {
    Initial,
    BeforeHtml,
    BeforeHead,
    InHead,
    AfterHead,
    InBody,
    Text,
    AfterBody,
    AfterAfterBody,
}

/// A `<meta>` encoding declaration seen by the constructor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodingDeclaration {
    pub label: String,
    pub line: u32,
}

#[derive(Clone, Debug)]
struct OpenElement {
    name: Arc<str>,
    handle: ContentHandle,
    /// Where children go: the element itself, or a template's content root.
    insert_into: ContentHandle,
}

#[derive(Debug)]
pub struct TreeConstructor {
    mode: InsertionMode,
    original_mode: InsertionMode,
    open: Vec<OpenElement>,
    head: Option<ContentHandle>,
    form: Option<ContentHandle>,
    fragment: bool,
    line: u32,
    deep_tree_reported: bool,
    encoding_declaration: Option<EncodingDeclaration>,
}

fn is_whitespace(text: &str) -> bool {
    text.bytes()
        .all(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0c'))
}

fn split_leading_whitespace(text: &str) -> (&str, &str) {
    let n = text
        .bytes()
        .take_while(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0c'))
        .count();
    text.split_at(n)
}

fn is_void(name: &str) -> bool {
    matches!(
        name,
        "area"
            | "base"
            | "basefont"
            | "bgsound"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "keygen"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

fn is_heading(name: &str) -> bool {
    matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

/// Start tags that close an open `p` in button scope.
fn closes_paragraph(name: &str) -> bool {
    matches!(
        name,
        "address"
            | "article"
            | "aside"
            | "blockquote"
            | "center"
            | "details"
            | "dialog"
            | "dir"
            | "div"
            | "dl"
            | "fieldset"
            | "figcaption"
            | "figure"
            | "footer"
            | "header"
            | "hgroup"
            | "main"
            | "menu"
            | "nav"
            | "ol"
            | "p"
            | "search"
            | "section"
            | "summary"
            | "ul"
            | "pre"
            | "listing"
            | "table"
            | "hr"
            | "xmp"
            | "plaintext"
            | "form"
    ) || is_heading(name)
}

fn is_special(name: &str) -> bool {
    closes_paragraph(name)
        || matches!(
            name,
            "applet"
                | "body"
                | "button"
                | "caption"
                | "dd"
                | "dt"
                | "head"
                | "html"
                | "li"
                | "marquee"
                | "object"
                | "td"
                | "template"
                | "th"
                | "tr"
        )
        || is_void(name)
}

fn is_scope_boundary(name: &str) -> bool {
    matches!(
        name,
        "applet" | "caption" | "html" | "table" | "td" | "th" | "marquee" | "object" | "template"
    )
}

fn has_implied_end_tag(name: &str) -> bool {
    matches!(
        name,
        "dd" | "dt" | "li" | "optgroup" | "option" | "p" | "rb" | "rp" | "rt" | "rtc"
    )
}

fn is_form_associated(name: &str) -> bool {
    matches!(
        name,
        "button" | "fieldset" | "input" | "object" | "output" | "select" | "textarea" | "img"
    )
}

fn belongs_in_head(name: &str) -> bool {
    matches!(
        name,
        "base"
            | "basefont"
            | "bgsound"
            | "link"
            | "meta"
            | "noframes"
            | "script"
            | "style"
            | "template"
            | "title"
    )
}

/// Quirks decision for a doctype, following the public/system id tables in
/// abbreviated form.
pub fn document_mode_for(doctype: &Doctype, force_quirks: bool) -> DocumentMode {
    const QUIRKY_PREFIXES: &[&str] = &[
        "+//silmaril//dtd html pro v0r11 19970101//",
        "-//as//dtd html 3.0 aswedit + extensions//",
        "-//ietf//dtd html 2.0",
        "-//ietf//dtd html 3",
        "-//ietf//dtd html//",
        "-//ietf//dtd html strict",
        "-//microsoft//dtd internet explorer",
        "-//netscape comm. corp.//dtd",
        "-//softquad",
        "-//sun microsystems corp.//dtd hotjava",
        "-//w3c//dtd html 3",
        "-//w3c//dtd html 4.0 frameset//",
        "-//w3c//dtd html 4.0 transitional//",
        "-//w3c//dtd w3 html//",
        "-//w3o//dtd w3 html 3.0//",
        "-//webtechs//dtd mozilla html",
    ];
    let public = doctype.public_id.to_ascii_lowercase();
    let system = doctype.system_id.to_ascii_lowercase();
    let html4_loose = public.starts_with("-//w3c//dtd html 4.01 frameset//")
        || public.starts_with("-//w3c//dtd html 4.01 transitional//");
    if force_quirks
        || doctype.name != "html"
        || public == "-//w3o//dtd w3 html strict 3.0//en//"
        || public == "-/w3c/dtd html 4.0 transitional/en"
        || public == "html"
        || system == "http://www.ibm.com/data/dtd/v11/ibmxhtml1-transitional.dtd"
        || QUIRKY_PREFIXES.iter().any(|p| public.starts_with(p))
        || (html4_loose && doctype.system_id.is_empty())
    {
        DocumentMode::Quirks
    } else if public.starts_with("-//w3c//dtd xhtml 1.0 frameset//")
        || public.starts_with("-//w3c//dtd xhtml 1.0 transitional//")
        || html4_loose
    {
        DocumentMode::LimitedQuirks
    } else {
        DocumentMode::Standards
    }
}

impl TreeConstructor {
    pub fn new() -> Self {
        Self {
            mode: InsertionMode::Initial,
            original_mode: InsertionMode::InBody,
            open: Vec::new(),
            head: None,
            form: None,
            fragment: false,
            line: 1,
            deep_tree_reported: false,
            encoding_declaration: None,
        }
    }

    /// Constructor for fragment parsing: content goes into `root` (an
    /// unattached `html` element), starting in body.
    pub fn for_fragment(root: ContentHandle, form: Option<ContentHandle>) -> Self {
        let mut this = Self::new();
        this.fragment = true;
        this.mode = InsertionMode::InBody;
        this.form = form;
        this.open.push(OpenElement {
            name: Arc::from("html"),
            handle: root,
            insert_into: root,
        });
        this
    }

    pub fn mode(&self) -> InsertionMode {
        self.mode
    }

    pub fn open_depth(&self) -> usize {
        self.open.len()
    }

    /// The first encoding declaration since the last call.
    pub fn take_encoding_declaration(&mut self) -> Option<EncodingDeclaration> {
        self.encoding_declaration.take()
    }

    /// Sets up `html > head, body > pre` for plain-text ingestion; every
    /// later character lands in the `pre`.
    pub fn start_plain_text(&mut self, b: &mut TreeBuilder<'_>) {
        b.start_plain_text();
        b.document_mode(DocumentMode::Standards);
        let html = b.create_element(Arc::from("html"), Vec::new(), 1);
        b.append_to_document(html);
        self.push(html, "html");
        let head = self.insert(b, "head", Vec::new(), false);
        self.head = Some(head);
        self.insert(b, "body", Vec::new(), true);
        self.insert(b, "pre", Vec::new(), true);
        self.mode = InsertionMode::InBody;
    }

    fn report(&self, b: &mut TreeBuilder<'_>, diagnostic: TreeDiagnostic) {
        b.report(diagnostic, self.line);
    }

    fn current(&self) -> Option<&OpenElement> {
        self.open.last()
    }

    fn current_name(&self) -> Option<&str> {
        self.current().map(|e| &*e.name)
    }

    fn push(&mut self, handle: ContentHandle, name: &str) {
        self.open.push(OpenElement {
            name: Arc::from(name),
            handle,
            insert_into: handle,
        });
    }

    fn insertion_parent(&mut self, b: &mut TreeBuilder<'_>) -> Option<ContentHandle> {
        if self.open.len() > MAX_TREE_DEPTH {
            if !self.deep_tree_reported {
                self.deep_tree_reported = true;
                self.report(b, TreeDiagnostic::DeepTree);
            }
            return Some(self.open[MAX_TREE_DEPTH - 1].insert_into);
        }
        self.current().map(|e| e.insert_into)
    }

    /// Creates an element, appends it at the insertion point and optionally
    /// pushes it on the stack of open elements.
    fn insert(
        &mut self,
        b: &mut TreeBuilder<'_>,
        name: &str,
        attributes: Vec<Attribute>,
        push: bool,
    ) -> ContentHandle {
        let handle = b.create_element(Arc::from(name), attributes, self.line);
        match self.insertion_parent(b) {
            Some(parent) => b.append_child(parent, handle),
            None => b.append_to_document(handle),
        }
        if push {
            self.push(handle, name);
        }
        handle
    }

    fn insert_characters(&mut self, b: &mut TreeBuilder<'_>, text: &str) {
        if let Some(parent) = self.insertion_parent(b) {
            b.append_characters(parent, text);
        }
    }

    fn insert_comment(&mut self, b: &mut TreeBuilder<'_>, text: String) {
        match self.insertion_parent(b) {
            Some(parent) => {
                let comment = b.create_comment(text);
                b.append_child(parent, comment);
            }
            None => b.append_comment_to_document(text),
        }
    }

    fn pop(&mut self) -> Option<OpenElement> {
        // The fragment root is never popped.
        if self.fragment && self.open.len() == 1 {
            return None;
        }
        self.open.pop()
    }

    fn pop_until(&mut self, name: &str) {
        while let Some(element) = self.pop() {
            if &*element.name == name {
                break;
            }
        }
    }

    fn has_in_scope(&self, name: &str, button: bool) -> bool {
        for element in self.open.iter().rev() {
            if &*element.name == name {
                return true;
            }
            if is_scope_boundary(&element.name) || (button && &*element.name == "button") {
                return false;
            }
        }
        false
    }

    fn has_open(&self, name: &str) -> bool {
        self.open.iter().any(|e| &*e.name == name)
    }

    fn generate_implied_end_tags(&mut self, except: Option<&str>) {
        while let Some(name) = self.current_name() {
            if !has_implied_end_tag(name) || Some(name) == except {
                break;
            }
            self.pop();
        }
    }

    fn close_paragraph(&mut self, b: &mut TreeBuilder<'_>) {
        if !self.has_in_scope("p", true) {
            return;
        }
        self.generate_implied_end_tags(Some("p"));
        if self.current_name() != Some("p") {
            let open: Arc<str> = Arc::from(self.current_name().unwrap_or_default());
            self.report(b, TreeDiagnostic::UnclosedElementsImplied(open));
        }
        self.pop_until("p");
    }

    fn check_encoding_declaration(&mut self, attributes: &[Attribute]) {
        if self.encoding_declaration.is_some() {
            return;
        }
        let label = attribute_value(attributes, "charset").map(str::to_string).or_else(|| {
            let http_equiv = attribute_value(attributes, "http-equiv")?;
            if !http_equiv.eq_ignore_ascii_case("content-type") {
                return None;
            }
            charset_from_content_type(attribute_value(attributes, "content")?).map(str::to_string)
        });
        if let Some(label) = label {
            self.encoding_declaration = Some(EncodingDeclaration {
                label,
                line: self.line,
            });
        }
    }

    /// Feeds one token. Returns after the token has been fully processed,
    /// including any reprocessing in a different insertion mode.
    pub fn process(&mut self, token: Token, b: &mut TreeBuilder<'_>) {
        let mut token = token;
        if let Token::StartTag { line, .. } | Token::EndTag { line, .. } = &token {
            self.line = *line;
        }
        // Bounded: every mode change on reprocess moves towards InBody.
        for _ in 0..16 {
            match self.step(token, b) {
                Some(again) => token = again,
                None => return,
            }
        }
        log::error!(target: "html.tree_builder", "token reprocessing did not settle in {:?}", self.mode);
    }

    /// Processes `token` in the current mode; returns it if it must be
    /// reprocessed in the (new) current mode.
    fn step(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match self.mode {
            InsertionMode::Initial => self.initial(token, b),
            InsertionMode::BeforeHtml => self.before_html(token, b),
            InsertionMode::BeforeHead => self.before_head(token, b),
            InsertionMode::InHead => self.in_head(token, b),
            InsertionMode::AfterHead => self.after_head(token, b),
            InsertionMode::InBody => self.in_body(token, b),
            InsertionMode::Text => self.text(token, b),
            InsertionMode::AfterBody => self.after_body(token, b),
            InsertionMode::AfterAfterBody => self.after_after_body(token, b),
        }
    }

    fn initial(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match token {
            Token::Characters(text) => {
                let (_, rest) = split_leading_whitespace(&text);
                if rest.is_empty() {
                    return None;
                }
                b.document_mode(DocumentMode::Quirks);
                self.mode = InsertionMode::BeforeHtml;
                Some(Token::Characters(rest.to_string()))
            }
            Token::Comment(text) => {
                b.append_comment_to_document(text);
                None
            }
            Token::Doctype {
                doctype,
                force_quirks,
            } => {
                let mode = document_mode_for(&doctype, force_quirks);
                match mode {
                    DocumentMode::Quirks => self.report(b, TreeDiagnostic::QuirkyDoctype),
                    DocumentMode::LimitedQuirks => {
                        self.report(b, TreeDiagnostic::AlmostStandardsDoctype)
                    }
                    DocumentMode::Standards => {}
                }
                b.append_doctype_to_document(doctype);
                b.document_mode(mode);
                self.mode = InsertionMode::BeforeHtml;
                None
            }
            token => {
                match &token {
                    Token::StartTag { .. } => {
                        self.report(b, TreeDiagnostic::StartTagWithoutDoctype)
                    }
                    Token::EndTag { .. } => {
                        self.report(b, TreeDiagnostic::EndTagSeenWithoutDoctype)
                    }
                    _ => {}
                }
                b.document_mode(DocumentMode::Quirks);
                self.mode = InsertionMode::BeforeHtml;
                Some(token)
            }
        }
    }

    fn before_html(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match token {
            Token::Doctype { .. } => {
                self.report(b, TreeDiagnostic::StrayDoctype);
                None
            }
            Token::Comment(text) => {
                b.append_comment_to_document(text);
                None
            }
            Token::Characters(text) => {
                let (_, rest) = split_leading_whitespace(&text);
                if rest.is_empty() {
                    return None;
                }
                self.implied_html(b);
                Some(Token::Characters(rest.to_string()))
            }
            Token::StartTag {
                name, attributes, ..
            } if &*name == "html" => {
                self.insert(b, "html", attributes, true);
                self.mode = InsertionMode::BeforeHead;
                None
            }
            Token::EndTag { name, .. }
                if !matches!(&*name, "head" | "body" | "html" | "br") =>
            {
                self.report(b, TreeDiagnostic::StrayEndTag(name));
                None
            }
            token => {
                self.implied_html(b);
                Some(token)
            }
        }
    }

    fn implied_html(&mut self, b: &mut TreeBuilder<'_>) {
        self.insert(b, "html", Vec::new(), true);
        self.mode = InsertionMode::BeforeHead;
    }

    fn before_head(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match token {
            Token::Characters(text) => {
                let (_, rest) = split_leading_whitespace(&text);
                if rest.is_empty() {
                    return None;
                }
                self.implied_head(b);
                Some(Token::Characters(rest.to_string()))
            }
            Token::Comment(text) => {
                self.insert_comment(b, text);
                None
            }
            Token::Doctype { .. } => {
                self.report(b, TreeDiagnostic::StrayDoctype);
                None
            }
            Token::StartTag {
                name, attributes, ..
            } if &*name == "html" => {
                self.merge_into_html(b, attributes);
                None
            }
            Token::StartTag {
                name, attributes, ..
            } if &*name == "head" => {
                let head = self.insert(b, "head", attributes, true);
                self.head = Some(head);
                self.mode = InsertionMode::InHead;
                None
            }
            Token::EndTag { name, .. }
                if !matches!(&*name, "head" | "body" | "html" | "br") =>
            {
                self.report(b, TreeDiagnostic::StrayEndTag(name));
                None
            }
            token => {
                self.implied_head(b);
                Some(token)
            }
        }
    }

    fn implied_head(&mut self, b: &mut TreeBuilder<'_>) {
        let head = self.insert(b, "head", Vec::new(), true);
        self.head = Some(head);
        self.mode = InsertionMode::InHead;
    }

    fn merge_into_html(&mut self, b: &mut TreeBuilder<'_>, attributes: Vec<Attribute>) {
        self.report(b, TreeDiagnostic::StrayStartTag(Arc::from("html")));
        if self.has_open("template") {
            return;
        }
        if let Some(html) = self.open.first().map(|e| e.handle) {
            b.add_attributes_to_element(html, attributes);
        }
    }

    /// Rules shared by "in head" and head-ish tags seen elsewhere. Returns
    /// the token back if it is not a head start tag.
    fn head_start_tag(
        &mut self,
        name: Arc<str>,
        attributes: Vec<Attribute>,
        self_closing: bool,
        line: u32,
        b: &mut TreeBuilder<'_>,
    ) -> Option<Token> {
        match &*name {
            "base" | "basefont" | "bgsound" | "link" | "meta" => {
                if &*name == "meta" {
                    self.check_encoding_declaration(&attributes);
                }
                self.insert(b, &name, attributes, false);
                None
            }
            "title" | "style" | "noframes" | "script" => {
                self.insert(b, &name, attributes, true);
                self.original_mode = self.mode;
                self.mode = InsertionMode::Text;
                None
            }
            "template" => {
                self.insert_template(b, attributes);
                None
            }
            _ => Some(Token::StartTag {
                name,
                attributes,
                self_closing,
                line,
            }),
        }
    }

    fn insert_template(&mut self, b: &mut TreeBuilder<'_>, attributes: Vec<Attribute>) {
        let init = attribute_value(&attributes, "shadowrootmode")
            .and_then(ShadowRootMode::from_attribute)
            .map(|mode| ShadowRootInit {
                mode,
                clonable: attribute_value(&attributes, "shadowrootclonable").is_some(),
                serializable: attribute_value(&attributes, "shadowrootserializable").is_some(),
                delegates_focus: attribute_value(&attributes, "shadowrootdelegatesfocus").is_some(),
            });
        // Declarative shadow roots attach to the current element and the
        // template itself is never inserted.
        let host = match init {
            Some(_) if self.open.len() > 1 || self.fragment => self.current().map(|e| e.handle),
            _ => None,
        };
        match (init, host) {
            (Some(init), Some(host)) => {
                let template = b.create_element(Arc::from("template"), attributes, self.line);
                let root = b.get_shadow_root_from_host(host, template, init);
                self.open.push(OpenElement {
                    name: Arc::from("template"),
                    handle: template,
                    insert_into: root,
                });
            }
            _ => {
                let template = self.insert(b, "template", attributes, false);
                let contents = b.get_document_fragment_for_template(template);
                self.open.push(OpenElement {
                    name: Arc::from("template"),
                    handle: template,
                    insert_into: contents,
                });
            }
        }
    }

    fn end_template(&mut self, b: &mut TreeBuilder<'_>) {
        if !self.has_open("template") {
            self.report(b, TreeDiagnostic::StrayEndTag(Arc::from("template")));
            return;
        }
        self.generate_implied_end_tags(None);
        if self.current_name() != Some("template") {
            self.report(
                b,
                TreeDiagnostic::UnclosedElements(Arc::from("template")),
            );
        }
        self.pop_until("template");
    }

    fn in_head(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        // Template contents are built with body rules wherever the template sits.
        if self.has_open("template") {
            return self.in_body(token, b);
        }
        match token {
            Token::Characters(text) => {
                let (space, rest) = split_leading_whitespace(&text);
                if !space.is_empty() {
                    self.insert_characters(b, space);
                }
                if rest.is_empty() {
                    return None;
                }
                self.leave_head();
                Some(Token::Characters(rest.to_string()))
            }
            Token::Comment(text) => {
                self.insert_comment(b, text);
                None
            }
            Token::Doctype { .. } => {
                self.report(b, TreeDiagnostic::StrayDoctype);
                None
            }
            Token::StartTag {
                name, attributes, ..
            } if &*name == "html" => {
                self.merge_into_html(b, attributes);
                None
            }
            Token::StartTag { name, .. } if &*name == "head" => {
                self.report(b, TreeDiagnostic::StrayStartTag(name));
                None
            }
            Token::StartTag {
                name,
                attributes,
                self_closing,
                line,
            } if belongs_in_head(&name) => {
                self.head_start_tag(name, attributes, self_closing, line, b)
            }
            Token::EndTag { name, .. } if &*name == "head" => {
                self.pop();
                self.mode = InsertionMode::AfterHead;
                None
            }
            Token::EndTag { name, .. } if &*name == "template" => {
                self.end_template(b);
                None
            }
            Token::EndTag { name, .. } if !matches!(&*name, "body" | "html" | "br") => {
                self.report(b, TreeDiagnostic::StrayEndTag(name));
                None
            }
            token => {
                self.leave_head();
                Some(token)
            }
        }
    }

    fn leave_head(&mut self) {
        if self.current_name() == Some("head") {
            self.pop();
        }
        self.mode = InsertionMode::AfterHead;
    }

    fn after_head(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        // Template contents are built with body rules wherever the template sits.
        if self.has_open("template") {
            return self.in_body(token, b);
        }
        match token {
            Token::Characters(text) => {
                let (space, rest) = split_leading_whitespace(&text);
                if !space.is_empty() {
                    self.insert_characters(b, space);
                }
                if rest.is_empty() {
                    return None;
                }
                self.implied_body(b);
                Some(Token::Characters(rest.to_string()))
            }
            Token::Comment(text) => {
                self.insert_comment(b, text);
                None
            }
            Token::Doctype { .. } => {
                self.report(b, TreeDiagnostic::StrayDoctype);
                None
            }
            Token::StartTag {
                name, attributes, ..
            } if &*name == "html" => {
                self.merge_into_html(b, attributes);
                None
            }
            Token::StartTag {
                name, attributes, ..
            } if &*name == "body" => {
                self.insert(b, "body", attributes, true);
                self.mode = InsertionMode::InBody;
                None
            }
            Token::StartTag { name, .. } if &*name == "frameset" => {
                self.report(b, TreeDiagnostic::FramesetStart);
                None
            }
            Token::StartTag {
                name,
                attributes,
                self_closing,
                line,
            } if belongs_in_head(&name) => {
                self.report(b, TreeDiagnostic::FooBetweenHeadAndBody(Arc::clone(&name)));
                let Some(head) = self.head else {
                    return None;
                };
                self.open.push(OpenElement {
                    name: Arc::from("head"),
                    handle: head,
                    insert_into: head,
                });
                let depth = self.open.len();
                let rest = self.head_start_tag(name, attributes, self_closing, line, b);
                // Raw-text elements stay open above the head until their end tag.
                if let Some(pos) = self.open[..depth.min(self.open.len())]
                    .iter()
                    .rposition(|e| e.handle == head)
                {
                    self.open.remove(pos);
                }
                rest
            }
            Token::StartTag { name, .. } if &*name == "head" => {
                self.report(b, TreeDiagnostic::StrayStartTag(name));
                None
            }
            Token::EndTag { name, .. } if &*name == "template" => {
                self.end_template(b);
                None
            }
            Token::EndTag { name, .. } if !matches!(&*name, "body" | "html" | "br") => {
                self.report(b, TreeDiagnostic::StrayEndTag(name));
                None
            }
            token => {
                self.implied_body(b);
                Some(token)
            }
        }
    }

    fn implied_body(&mut self, b: &mut TreeBuilder<'_>) {
        self.insert(b, "body", Vec::new(), true);
        self.mode = InsertionMode::InBody;
    }

    fn in_body(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match token {
            Token::Characters(text) => {
                self.insert_characters(b, &text);
                None
            }
            Token::Comment(text) => {
                self.insert_comment(b, text);
                None
            }
            Token::Doctype { .. } => {
                self.report(b, TreeDiagnostic::StrayDoctype);
                None
            }
            Token::StartTag {
                name,
                attributes,
                self_closing,
                line,
            } => self.in_body_start_tag(name, attributes, self_closing, line, b),
            Token::EndTag { name, .. } => self.in_body_end_tag(name, b),
            Token::Eof => {
                self.end_of_stream(b);
                None
            }
        }
    }

    fn in_body_start_tag(
        &mut self,
        name: Arc<str>,
        attributes: Vec<Attribute>,
        self_closing: bool,
        line: u32,
        b: &mut TreeBuilder<'_>,
    ) -> Option<Token> {
        if self_closing && !is_void(&name) {
            self.report(b, TreeDiagnostic::SelfClosing);
        }
        match &*name {
            "html" => self.merge_into_html(b, attributes),
            "body" => {
                self.report(b, TreeDiagnostic::StrayStartTag(Arc::clone(&name)));
                let body = self.open.get(1).filter(|e| &*e.name == "body").map(|e| e.handle);
                if let (Some(body), false) = (body, self.has_open("template")) {
                    b.add_attributes_to_element(body, attributes);
                }
            }
            "frameset" => self.report(b, TreeDiagnostic::FramesetStart),
            n if belongs_in_head(n) => {
                return self.head_start_tag(name, attributes, self_closing, line, b);
            }
            "form" => {
                if self.form.is_some() && !self.has_open("template") {
                    self.report(b, TreeDiagnostic::FormWhenFormOpen);
                    return None;
                }
                self.close_paragraph(b);
                let form = self.insert(b, "form", attributes, true);
                if !self.has_open("template") {
                    self.form = Some(form);
                }
            }
            n if is_heading(n) => {
                self.close_paragraph(b);
                if self.current_name().is_some_and(is_heading) {
                    self.report(b, TreeDiagnostic::HeadingWhenHeadingOpen);
                    self.pop();
                }
                self.insert(b, &name, attributes, true);
            }
            "li" | "dd" | "dt" => {
                let closes: &[&str] = if &*name == "li" { &["li"] } else { &["dd", "dt"] };
                let mut open_item = None;
                for element in self.open.iter().rev() {
                    if closes.contains(&&*element.name) {
                        open_item = Some(Arc::clone(&element.name));
                        break;
                    }
                    if is_special(&element.name) && !matches!(&*element.name, "address" | "div" | "p")
                    {
                        break;
                    }
                }
                if let Some(open) = open_item {
                    self.generate_implied_end_tags(Some(&open));
                    if self.current_name() != Some(&*open) {
                        self.report(b, TreeDiagnostic::UnclosedElementsImplied(Arc::clone(&open)));
                    }
                    self.pop_until(&open);
                }
                self.close_paragraph(b);
                self.insert(b, &name, attributes, true);
            }
            "a" | "nobr" => {
                if self.has_in_scope(&name, false) {
                    self.report(b, TreeDiagnostic::FooSeenWhenFooOpen(Arc::clone(&name)));
                    self.pop_until(&name);
                }
                self.insert(b, &name, attributes, true);
            }
            "image" => {
                self.report(b, TreeDiagnostic::Image);
                return Some(Token::StartTag {
                    name: Arc::from("img"),
                    attributes,
                    self_closing,
                    line,
                });
            }
            "textarea" => {
                let element = self.insert(b, "textarea", attributes, true);
                self.associate_form(b, element);
                self.original_mode = self.mode;
                self.mode = InsertionMode::Text;
            }
            "plaintext" => {
                self.close_paragraph(b);
                self.insert(b, "plaintext", attributes, true);
                b.start_plain_text();
            }
            "select" => {
                if self.has_in_scope("select", false) {
                    self.report(b, TreeDiagnostic::StartSelectWhereEndSelectExpected);
                    self.pop_until("select");
                    return None;
                }
                let element = self.insert(b, "select", attributes, true);
                self.associate_form(b, element);
            }
            n if is_void(n) => {
                if matches!(n, "hr") {
                    self.close_paragraph(b);
                }
                let element = self.insert(b, &name, attributes, false);
                if is_form_associated(n) {
                    self.associate_form(b, element);
                }
            }
            n => {
                if closes_paragraph(n) {
                    self.close_paragraph(b);
                }
                let element = self.insert(b, &name, attributes, true);
                if is_form_associated(n) {
                    self.associate_form(b, element);
                }
            }
        }
        None
    }

    fn associate_form(&mut self, b: &mut TreeBuilder<'_>, element: ContentHandle) {
        if let (Some(form), false) = (self.form, self.has_open("template")) {
            b.set_form_element(element, form);
        }
    }

    fn in_body_end_tag(&mut self, name: Arc<str>, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match &*name {
            "body" | "html" => {
                if !self.has_in_scope("body", false) {
                    self.report(b, TreeDiagnostic::StrayEndTag(Arc::clone(&name)));
                    return None;
                }
                if let Some(open) = self
                    .open
                    .iter()
                    .rev()
                    .find(|e| !has_implied_end_tag(&e.name) && !matches!(&*e.name, "body" | "html"))
                {
                    self.report(b, TreeDiagnostic::EndWithUnclosedElements(Arc::clone(&open.name)));
                }
                self.mode = InsertionMode::AfterBody;
                if &*name == "html" {
                    return Some(Token::EndTag { name, line: self.line });
                }
            }
            "p" => {
                if !self.has_in_scope("p", true) {
                    self.report(b, TreeDiagnostic::NoElementToCloseButEndTagSeen(name));
                    self.insert(b, "p", Vec::new(), false);
                    return None;
                }
                self.close_paragraph(b);
            }
            "br" => {
                self.report(b, TreeDiagnostic::EndTagBr);
                self.insert(b, "br", Vec::new(), false);
            }
            "form" => {
                let form = self.form.take();
                let position = match form {
                    Some(form) if self.has_in_scope("form", false) => {
                        self.open.iter().rposition(|e| e.handle == form)
                    }
                    _ => None,
                };
                let Some(position) = position else {
                    self.report(b, TreeDiagnostic::StrayEndTag(name));
                    return None;
                };
                self.generate_implied_end_tags(None);
                if self.open.len() - 1 != position {
                    self.report(b, TreeDiagnostic::EndTagViolatesNestingRules(name));
                }
                self.open.remove(position);
            }
            "template" => self.end_template(b),
            n if is_heading(n) => {
                if !["h1", "h2", "h3", "h4", "h5", "h6"]
                    .iter()
                    .any(|h| self.has_in_scope(h, false))
                {
                    self.report(b, TreeDiagnostic::StrayEndTag(name));
                    return None;
                }
                self.generate_implied_end_tags(None);
                if self.current_name() != Some(n) {
                    self.report(b, TreeDiagnostic::EndTagViolatesNestingRules(Arc::clone(&name)));
                }
                while let Some(element) = self.pop() {
                    if is_heading(&element.name) {
                        break;
                    }
                }
            }
            n if is_special(n) => {
                if !self.has_in_scope(n, false) {
                    self.report(b, TreeDiagnostic::StrayEndTag(Arc::clone(&name)));
                    return None;
                }
                self.generate_implied_end_tags(Some(n));
                if self.current_name() != Some(n) {
                    self.report(b, TreeDiagnostic::EndTagViolatesNestingRules(Arc::clone(&name)));
                }
                self.pop_until(n);
            }
            _ => self.any_other_end_tag(name, b),
        }
        None
    }

    fn any_other_end_tag(&mut self, name: Arc<str>, b: &mut TreeBuilder<'_>) {
        let Some(position) = self.open.iter().rposition(|e| e.name == name || is_special(&e.name))
        else {
            self.report(b, TreeDiagnostic::StrayEndTag(name));
            return;
        };
        if self.open[position].name != name {
            self.report(b, TreeDiagnostic::StrayEndTag(name));
            return;
        }
        self.generate_implied_end_tags(Some(&name));
        if let Some(open) = self.current_name().filter(|open| **open != *name) {
            let open = Arc::from(open);
            self.report(
                b,
                TreeDiagnostic::EndTagDidNotMatchCurrentOpenElement {
                    name: Arc::clone(&name),
                    open,
                },
            );
        }
        while self.open.len() > position {
            if self.pop().is_none() {
                break;
            }
        }
    }

    fn text(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match token {
            Token::Characters(text) => {
                self.insert_characters(b, &text);
                None
            }
            Token::EndTag { name, line } => {
                let Some(element) = self.pop() else {
                    self.mode = self.original_mode;
                    return None;
                };
                if element.name != name {
                    self.report(b, TreeDiagnostic::EndTagDidNotMatchCurrentOpenElement {
                        name,
                        open: Arc::clone(&element.name),
                    });
                }
                self.mode = self.original_mode;
                if &*element.name == "script" {
                    b.script_end(element.handle, line);
                }
                None
            }
            Token::Eof => {
                if let Some(element) = self.pop() {
                    self.report(b, TreeDiagnostic::UnclosedElements(element.name));
                }
                self.mode = self.original_mode;
                Some(Token::Eof)
            }
            // Markup inside a raw-text element the tokenizer did not treat as
            // raw text (`<script/>`, `noframes`): close the element.
            other => {
                if let Some(element) = self.pop() {
                    self.report(b, TreeDiagnostic::UnclosedElements(element.name));
                }
                self.mode = self.original_mode;
                Some(other)
            }
        }
    }

    fn after_body(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match token {
            Token::Characters(text) if is_whitespace(&text) => {
                self.insert_characters(b, &text);
                None
            }
            Token::Comment(text) => {
                if let Some(html) = self.open.first().map(|e| e.handle) {
                    let comment = b.create_comment(text);
                    b.append_child(html, comment);
                }
                None
            }
            Token::Doctype { .. } => {
                self.report(b, TreeDiagnostic::StrayDoctype);
                None
            }
            Token::EndTag { name, .. } if &*name == "html" => {
                self.mode = InsertionMode::AfterAfterBody;
                None
            }
            Token::Eof => {
                self.end_of_stream(b);
                None
            }
            token => {
                match &token {
                    Token::Characters(_) => self.report(b, TreeDiagnostic::NonSpaceAfterBody),
                    Token::StartTag { name, .. } => {
                        self.report(b, TreeDiagnostic::StrayStartTag(Arc::clone(name)))
                    }
                    Token::EndTag { .. } => self.report(b, TreeDiagnostic::EndTagAfterBody),
                    _ => {}
                }
                self.mode = InsertionMode::InBody;
                Some(token)
            }
        }
    }

    fn after_after_body(&mut self, token: Token, b: &mut TreeBuilder<'_>) -> Option<Token> {
        match token {
            Token::Comment(text) => {
                b.append_comment_to_document(text);
                None
            }
            Token::Characters(text) if is_whitespace(&text) => {
                self.insert_characters(b, &text);
                None
            }
            Token::Doctype { .. } => None,
            Token::Eof => {
                self.end_of_stream(b);
                None
            }
            token => {
                self.report(b, TreeDiagnostic::NonSpaceInTrailer);
                self.mode = InsertionMode::InBody;
                Some(token)
            }
        }
    }

    fn end_of_stream(&mut self, b: &mut TreeBuilder<'_>) {
        let unclosed = self.open.iter().rev().find(|e| {
            !has_implied_end_tag(&e.name) && !matches!(&*e.name, "body" | "html" | "plaintext")
        });
        if let Some(open) = unclosed.filter(|_| !b.is_plain_text()) {
            self.report(b, TreeDiagnostic::EndWithUnclosedElements(Arc::clone(&open.name)));
        }
        b.stream_ended();
    }
}

impl Default for TreeConstructor {
    fn default() -> Self {
        Self::new()
    }
}
