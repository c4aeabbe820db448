//! Streaming tokenizer over decoded text.
//!
//! Input arrives in arbitrary chunks. `next_token` only emits a token once it
//! is complete; a construct cut off at the end of the buffer waits for more
//! input, or is resolved when the stream has ended.
//!
//! Known limitations (intentional):
//! - Not the HTML5 character-level state machine; no parse-error recovery
//!   beyond what the tree constructor needs.
//! - Tag/attribute names are ASCII `[A-Za-z0-9:_-]`, lowercased.
//! - Character references: `&amp; &lt; &gt; &quot; &apos; &nbsp;` and
//!   semicolon-terminated numeric references only.
use std::borrow::Cow;
use std::sync::Arc;

use memchr::{memchr, memchr_iter};

use crate::types::{Attribute, Doctype, Token};

const COMMENT_START: &str = "<!--";
const COMMENT_END: &str = "-->";

// Compact the buffer once this many bytes have been consumed.
const COMPACT_THRESHOLD: usize = 8 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Mode {
    Data,
    /// Inside `script`/`style`/`title`/`textarea` until the matching end tag.
    RawText { end: Arc<str>, decode: bool },
    PlainText,
}

#[derive(Debug)]
pub struct Tokenizer {
    buffer: String,
    pos: usize,
    line: u32,
    mode: Mode,
    ended: bool,
    eof_emitted: bool,
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b':'
}

fn starts_with_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack[..needle.len()].eq_ignore_ascii_case(needle)
}

fn count_lines(text: &str) -> u32 {
    memchr_iter(b'\n', text.as_bytes()).count() as u32
}

/// Start of `</name` followed by whitespace, `/` or `>`, if present.
fn find_raw_text_end(haystack: &str, name: &str) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        i += memchr(b'<', &bytes[i..])?;
        let rest = &bytes[i..];
        if rest.len() > 2 + name.len()
            && rest[1] == b'/'
            && rest[2..2 + name.len()].eq_ignore_ascii_case(name.as_bytes())
            && matches!(rest[2 + name.len()], b'>' | b'/' | b' ' | b'\t' | b'\n' | b'\r' | b'\x0c')
        {
            return Some(i);
        }
        i += 1;
    }
    None
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            pos: 0,
            line: 1,
            mode: Mode::Data,
            ended: false,
            eof_emitted: false,
        }
    }

    /// Line of the next unconsumed character.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Bytes buffered but not yet tokenized.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.pos
    }

    pub fn feed(&mut self, text: &str) {
        if self.ended {
            log::debug!(target: "html.tokenizer", "input after end of stream ignored");
            return;
        }
        if self.pos >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        self.buffer.push_str(text);
    }

    pub fn end(&mut self) {
        self.ended = true;
    }

    /// Everything from here on is character data.
    pub fn set_plain_text(&mut self) {
        self.mode = Mode::PlainText;
    }

    /// Treats everything up to `</name` as text (fragment contexts and the
    /// tree constructor's raw-text elements).
    pub fn set_raw_text(&mut self, name: &str) {
        let decode = matches!(name, "title" | "textarea");
        self.mode = Mode::RawText {
            end: Arc::from(name),
            decode,
        };
    }

    fn advance(&mut self, len: usize) -> &str {
        let start = self.pos;
        self.pos += len;
        let consumed = &self.buffer[start..self.pos];
        self.line += count_lines(consumed);
        consumed
    }

    pub fn next_token(&mut self) -> Option<Token> {
        if self.pos >= self.buffer.len() {
            if self.ended && !self.eof_emitted {
                self.eof_emitted = true;
                return Some(Token::Eof);
            }
            return None;
        }
        match self.mode.clone() {
            Mode::PlainText => {
                let len = self.buffer.len() - self.pos;
                Some(Token::Characters(self.advance(len).to_string()))
            }
            Mode::RawText { end, decode } => self.raw_text(&end, decode),
            Mode::Data => self.data(),
        }
    }

    fn raw_text(&mut self, end: &str, decode: bool) -> Option<Token> {
        let rest = &self.buffer[self.pos..];
        let len = match find_raw_text_end(rest, end) {
            Some(len) => {
                self.mode = Mode::Data;
                len
            }
            None if self.ended => rest.len(),
            // A partial `</name` may sit at the end of the buffer.
            None => match rest.rfind('<') {
                Some(cut) => cut,
                None => rest.len(),
            },
        };
        if len == 0 {
            return if self.mode == Mode::Data {
                self.data()
            } else {
                None
            };
        }
        let text = self.advance(len);
        let text = if decode {
            decode_character_references(text).into_owned()
        } else {
            text.to_string()
        };
        Some(Token::Characters(text))
    }

    fn data(&mut self) -> Option<Token> {
        let rest = &self.buffer[self.pos..];
        let bytes = rest.as_bytes();
        if bytes[0] != b'<' {
            let len = match memchr(b'<', bytes) {
                Some(len) => len,
                // Keep a trailing character reference whole across chunks.
                None if !self.ended => match rest.rfind('&') {
                    Some(amp) if !rest[amp..].contains(';') && rest.len() - amp < 12 => amp,
                    _ => rest.len(),
                },
                None => rest.len(),
            };
            if len == 0 {
                return None;
            }
            let text = decode_character_references(self.advance(len)).into_owned();
            return Some(Token::Characters(text));
        }
        self.markup()
    }

    fn markup(&mut self) -> Option<Token> {
        let rest = &self.buffer[self.pos..];
        let bytes = rest.as_bytes();
        if bytes.len() < 2 && !self.ended {
            return None;
        }
        if rest.starts_with(COMMENT_START) {
            return match rest[COMMENT_START.len()..].find(COMMENT_END) {
                Some(end) => {
                    let text = rest[COMMENT_START.len()..COMMENT_START.len() + end].to_string();
                    self.advance(COMMENT_START.len() + end + COMMENT_END.len());
                    Some(Token::Comment(text))
                }
                None if self.ended => {
                    let text = rest[COMMENT_START.len()..].to_string();
                    let len = rest.len();
                    self.advance(len);
                    Some(Token::Comment(text))
                }
                None => None,
            };
        }
        if !self.ended && COMMENT_START.starts_with(rest) {
            return None;
        }
        let second = bytes.get(1).copied().unwrap_or(b' ');
        match second {
            b'!' | b'?' => self.declaration(),
            b'/' => self.end_tag(),
            c if c.is_ascii_alphabetic() => self.start_tag(),
            _ => {
                self.advance(1);
                Some(Token::Characters("<".to_string()))
            }
        }
    }

    /// `<!DOCTYPE ...>`, or a bogus comment for any other `<!`/`<?` construct.
    fn declaration(&mut self) -> Option<Token> {
        let rest = &self.buffer[self.pos..];
        let Some(close) = memchr(b'>', rest.as_bytes()) else {
            if self.ended {
                let text = rest[2..].to_string();
                let len = rest.len();
                self.advance(len);
                return Some(Token::Comment(text));
            }
            return None;
        };
        let body = &rest[2..close];
        let token = if starts_with_ignore_ascii_case(body.as_bytes(), b"doctype") {
            let (doctype, force_quirks) = parse_doctype(&body[7..]);
            Token::Doctype {
                doctype,
                force_quirks,
            }
        } else {
            Token::Comment(body.to_string())
        };
        self.advance(close + 1);
        Some(token)
    }

    fn end_tag(&mut self) -> Option<Token> {
        let rest = &self.buffer[self.pos..];
        let bytes = rest.as_bytes();
        let Some(close) = memchr(b'>', bytes) else {
            if self.ended {
                let len = rest.len();
                self.advance(len);
                return self.next_token();
            }
            return None;
        };
        let line = self.line;
        let name_len = bytes[2..].iter().take_while(|c| is_name_char(**c)).count();
        if name_len == 0 {
            // `</>` is dropped; `</ junk>` becomes a bogus comment.
            let text = rest[2..close].to_string();
            self.advance(close + 1);
            return if text.is_empty() {
                self.next_token()
            } else {
                Some(Token::Comment(text))
            };
        }
        let name: Arc<str> = Arc::from(rest[2..2 + name_len].to_ascii_lowercase());
        self.advance(close + 1);
        Some(Token::EndTag { name, line })
    }

    fn start_tag(&mut self) -> Option<Token> {
        let rest = &self.buffer[self.pos..];
        let bytes = rest.as_bytes();
        let line = self.line;
        let name_len = bytes[1..].iter().take_while(|c| is_name_char(**c)).count();
        let name: Arc<str> = Arc::from(rest[1..1 + name_len].to_ascii_lowercase());

        let mut attributes: Vec<Attribute> = Vec::new();
        let mut self_closing = false;
        let mut k = 1 + name_len;
        let len = bytes.len();
        let complete = loop {
            while k < len && bytes[k].is_ascii_whitespace() {
                k += 1;
            }
            if k >= len {
                break false;
            }
            match bytes[k] {
                b'>' => break true,
                b'/' => {
                    if k + 1 < len && bytes[k + 1] == b'>' {
                        self_closing = true;
                        k += 1;
                        break true;
                    }
                    k += 1;
                    continue;
                }
                _ => {}
            }
            let name_start = k;
            while k < len && !bytes[k].is_ascii_whitespace() && !matches!(bytes[k], b'>' | b'/' | b'=') {
                k += 1;
            }
            if name_start == k {
                k += 1;
                continue;
            }
            let attr_name = rest[name_start..k].to_ascii_lowercase();
            while k < len && bytes[k].is_ascii_whitespace() {
                k += 1;
            }
            let mut value = Cow::Borrowed("");
            if k < len && bytes[k] == b'=' {
                k += 1;
                while k < len && bytes[k].is_ascii_whitespace() {
                    k += 1;
                }
                if k < len && (bytes[k] == b'"' || bytes[k] == b'\'') {
                    let quote = bytes[k];
                    let Some(end) = memchr(quote, &bytes[k + 1..]) else {
                        break false;
                    };
                    value = decode_character_references(&rest[k + 1..k + 1 + end]);
                    k += end + 2;
                } else {
                    let vstart = k;
                    while k < len && !bytes[k].is_ascii_whitespace() && bytes[k] != b'>' {
                        k += 1;
                    }
                    value = decode_character_references(&rest[vstart..k]);
                }
            }
            // Duplicate attributes are dropped; the first occurrence wins.
            if !attributes.iter().any(|a| *a.name == *attr_name) {
                attributes.push(Attribute::new(attr_name, value.into_owned()));
            }
        };
        if !complete {
            if self.ended {
                // A tag cut off by the end of input is dropped.
                let len = rest.len();
                self.advance(len);
                return self.next_token();
            }
            return None;
        }
        self.advance(k + 1);
        if !self_closing && matches!(&*name, "script" | "style" | "title" | "textarea") {
            self.set_raw_text(&name);
        }
        Some(Token::StartTag {
            name,
            attributes,
            self_closing,
            line,
        })
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Tokenizer {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.next_token()
    }
}

fn parse_doctype(body: &str) -> (Doctype, bool) {
    let mut rest = body.trim_start();
    let name_len = rest
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(rest.len());
    let name = rest[..name_len].to_ascii_lowercase();
    rest = rest[name_len..].trim_start();
    let mut doctype = Doctype {
        name,
        ..Doctype::default()
    };
    let mut force_quirks = doctype.name.is_empty();

    let keyword = |rest: &str, kw: &str| starts_with_ignore_ascii_case(rest.as_bytes(), kw.as_bytes());
    let quoted = |rest: &str| -> Option<(String, usize)> {
        let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let end = rest[1..].find(quote)?;
        Some((rest[1..1 + end].to_string(), end + 2))
    };
    if keyword(rest, "public") {
        rest = rest[6..].trim_start();
        match quoted(rest) {
            Some((public_id, used)) => {
                doctype.public_id = public_id;
                rest = rest[used..].trim_start();
                if let Some((system_id, _)) = quoted(rest) {
                    doctype.system_id = system_id;
                }
            }
            None => force_quirks = true,
        }
    } else if keyword(rest, "system") {
        rest = rest[6..].trim_start();
        match quoted(rest) {
            Some((system_id, _)) => doctype.system_id = system_id,
            None => force_quirks = true,
        }
    }
    (doctype, force_quirks)
}

/// Decodes a small, fixed set of character references. Anything malformed is
/// left as written.
pub(crate) fn decode_character_references(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    let Some(first) = memchr(b'&', bytes) else {
        return Cow::Borrowed(s);
    };
    let mut out = String::with_capacity(s.len());
    out.push_str(&s[..first]);
    let mut i = first;
    while i < bytes.len() {
        if bytes[i] != b'&' {
            let next = memchr(b'&', &bytes[i..]).map_or(bytes.len(), |n| i + n);
            out.push_str(&s[i..next]);
            i = next;
            continue;
        }
        match decode_one(&s[i..]) {
            Some((c, used)) => {
                out.push(c);
                i += used;
            }
            None => {
                out.push('&');
                i += 1;
            }
        }
    }
    Cow::Owned(out)
}

fn decode_one(s: &str) -> Option<(char, usize)> {
    const NAMED: &[(&str, char)] = &[
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&quot;", '"'),
        ("&apos;", '\''),
        ("&nbsp;", '\u{a0}'),
    ];
    if let Some((name, c)) = NAMED.iter().find(|(name, _)| s.starts_with(name)) {
        return Some((*c, name.len()));
    }
    let digits = s.strip_prefix("&#")?;
    let (radix, digits, prefix) = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => (16, hex, 3),
        None => (10, digits, 2),
    };
    let end = digits.find(';')?;
    if end == 0 || end > 7 {
        return None;
    }
    let value = u32::from_str_radix(&digits[..end], radix).ok()?;
    let c = char::from_u32(value).filter(|c| *c != '\0')?;
    Some((c, prefix + end + 1))
}
