//! Incremental byte decoders for streaming document sources.
//!
//! Both decoders append to a caller-owned `String` and never fail: malformed
//! input is replaced with U+FFFD and decoding makes forward progress.

/// UTF-8 decoder that keeps an incomplete trailing sequence between chunks.
#[derive(Clone, Debug, Default)]
pub struct Utf8Decoder {
    carry: [u8; 4],
    carry_len: usize,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete sequence waiting for the next chunk.
    pub fn pending(&self) -> &[u8] {
        &self.carry[..self.carry_len]
    }

    pub fn decode_chunk(&mut self, mut bytes: &[u8], out: &mut String) {
        // Complete a sequence left over from the previous chunk one byte at a
        // time; the carry holds at most three bytes.
        while self.carry_len > 0 && !bytes.is_empty() {
            let expected = utf8_sequence_len(self.carry[0]);
            if expected == 0 || !is_continuation(bytes[0]) {
                out.push('\u{FFFD}');
                self.carry_len = 0;
                break;
            }
            self.carry[self.carry_len] = bytes[0];
            self.carry_len += 1;
            bytes = &bytes[1..];
            if self.carry_len == expected {
                let seq = self.carry;
                let len = self.carry_len;
                self.carry_len = 0;
                self.decode_complete(&seq[..len], out);
            }
        }
        if !bytes.is_empty() {
            self.decode_complete(bytes, out);
        }
    }

    /// Flushes a dangling partial sequence as a replacement character.
    pub fn finish(&mut self, out: &mut String) {
        if self.carry_len > 0 {
            out.push('\u{FFFD}');
            self.carry_len = 0;
        }
    }

    fn decode_complete(&mut self, mut bytes: &[u8], out: &mut String) {
        while !bytes.is_empty() {
            match std::str::from_utf8(bytes) {
                Ok(s) => {
                    out.push_str(s);
                    return;
                }
                Err(err) => {
                    let (valid, rest) = bytes.split_at(err.valid_up_to());
                    // `valid` is verified UTF-8, so the lossy path never substitutes.
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push('\u{FFFD}');
                            bytes = &rest[len..];
                        }
                        None => {
                            self.carry[..rest.len()].copy_from_slice(rest);
                            self.carry_len = rest.len();
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn utf8_sequence_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 0,
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// windows-1252 code points for bytes 0x80..=0x9F; the rest map to Latin-1.
const WINDOWS_1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

/// Single-byte windows-1252 decoding. Stateless, so chunk boundaries never matter.
pub fn decode_windows_1252(bytes: &[u8], out: &mut String) {
    out.reserve(bytes.len());
    for &b in bytes {
        let ch = match b {
            0x80..=0x9F => WINDOWS_1252_HIGH[usize::from(b - 0x80)],
            _ => char::from(b),
        };
        out.push(ch);
    }
}
