//! Document encodings, their provenance, and restart requests.

use std::fmt;

use tools::decode::{Utf8Decoder, decode_windows_1252};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Encoding {
    Utf8,
    Windows1252,
}

impl Encoding {
    /// Resolves a WHATWG encoding label for the encodings this parser decodes.
    pub fn for_label(label: &str) -> Option<Self> {
        let label = label.trim_matches(|c: char| c.is_ascii_whitespace());
        const UTF8: &[&str] = &["unicode-1-1-utf-8", "unicode11utf8", "unicode20utf8", "utf-8", "utf8", "x-unicode20utf8"];
        const WINDOWS_1252: &[&str] = &[
            "ansi_x3.4-1968", "ascii", "cp1252", "cp819", "csisolatin1", "ibm819", "iso-8859-1",
            "iso-ir-100", "iso8859-1", "iso88591", "iso_8859-1", "iso_8859-1:1987", "l1", "latin1",
            "us-ascii", "windows-1252", "x-cp1252",
        ];
        if UTF8.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            Some(Encoding::Utf8)
        } else if WINDOWS_1252.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            Some(Encoding::Windows1252)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Windows1252 => "windows-1252",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the current encoding decision came from, ordered by confidence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CharsetSource {
    Fallback,
    Sniffed,
    ByteOrderMark,
    MetaPrescan,
    Meta,
    HttpHeader,
    UserForced,
}

impl CharsetSource {
    /// Whether a later in-document declaration may still override this decision.
    pub fn is_tentative(self) -> bool {
        self < CharsetSource::ByteOrderMark
    }
}

/// Location in the decoded stream where a parser decision was made.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourcePosition {
    pub line: u32,
    pub offset: usize,
}

/// Parsing produced output under the wrong encoding and must restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CharsetSwitchRequest {
    pub encoding: Encoding,
    pub source: CharsetSource,
    pub position: SourcePosition,
}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Streaming decoder for the supported encodings.
#[derive(Debug)]
pub struct StreamDecoder {
    encoding: Encoding,
    utf8: Utf8Decoder,
    bom_checked: bool,
    bom_carry: Vec<u8>,
}

impl StreamDecoder {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            utf8: Utf8Decoder::new(),
            bom_checked: false,
            bom_carry: Vec::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decodes `bytes`, returning `true` if a UTF-8 byte order mark was consumed
    /// (which forces UTF-8 regardless of the configured encoding).
    pub fn decode(&mut self, bytes: &[u8], out: &mut String) -> bool {
        if self.bom_checked {
            self.decode_body(bytes, out);
            return false;
        }
        let mut head = std::mem::take(&mut self.bom_carry);
        head.extend_from_slice(bytes);
        if head.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&head) {
            self.bom_carry = head;
            return false;
        }
        self.bom_checked = true;
        let saw_bom = head.starts_with(UTF8_BOM);
        if saw_bom {
            self.encoding = Encoding::Utf8;
            head.drain(..UTF8_BOM.len());
        }
        self.decode_body(&head, out);
        saw_bom
    }

    pub fn finish(&mut self, out: &mut String) {
        if !self.bom_checked {
            self.bom_checked = true;
            let carry = std::mem::take(&mut self.bom_carry);
            self.decode_body(&carry, out);
        }
        self.utf8.finish(out);
    }

    fn decode_body(&mut self, bytes: &[u8], out: &mut String) {
        match self.encoding {
            Encoding::Utf8 => self.utf8.decode_chunk(bytes, out),
            Encoding::Windows1252 => decode_windows_1252(bytes, out),
        }
    }
}

/// Extracts the charset from a `content` attribute such as
/// `text/html; charset=windows-1252`.
pub fn charset_from_content_type(content: &str) -> Option<&str> {
    let lower = content.to_ascii_lowercase();
    let start = lower.find("charset")? + "charset".len();
    let rest = content[start..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let rest = rest.trim_start_matches(['"', '\'']);
    let end = rest
        .find(|c: char| c == ';' || c == '"' || c == '\'' || c.is_ascii_whitespace())
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}
