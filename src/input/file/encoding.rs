// SPDX-License-Identifier: Apache-2.0

//! Character encodings of log files: line terminator byte patterns, character width
//! and conversion of a line to UTF-8.

use crate::error::{Error, Result};
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use std::borrow::Cow;

#[derive(Debug, Clone, Copy)]
enum Decoder {
    /// No encoding configured; bytes are taken as UTF-8.
    Raw,
    Label(&'static Encoding),
    Utf32 { big_endian: bool },
}

/// Encoding of a target's files.
#[derive(Debug, Clone)]
pub struct TextEncoding {
    name: String,
    cr: &'static [u8],
    lf: &'static [u8],
    width: usize,
    decoder: Decoder,
}

impl Default for TextEncoding {
    fn default() -> Self {
        Self {
            name: String::new(),
            cr: b"\r",
            lf: b"\n",
            width: 1,
            decoder: Decoder::Raw,
        }
    }
}

impl TextEncoding {
    /// Look up an encoding by name. An empty name means single-byte input.
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Ok(Self::default());
        }

        let (cr, lf, width, decoder): (&'static [u8], &'static [u8], usize, Decoder) =
            match upper.as_str() {
                "UNICODE" | "UNICODELITTLE" | "UTF-16" | "UTF-16LE" | "UCS-2" | "UCS-2LE" => {
                    (b"\r\0", b"\n\0", 2, Decoder::Label(UTF_16LE))
                }
                "UNICODEBIG" | "UNICODEFFFE" | "UTF-16BE" | "UCS-2BE" => {
                    (b"\0\r", b"\0\n", 2, Decoder::Label(UTF_16BE))
                }
                "UTF-32" | "UTF-32LE" => (
                    b"\r\0\0\0",
                    b"\n\0\0\0",
                    4,
                    Decoder::Utf32 { big_endian: false },
                ),
                "UTF-32BE" => (
                    b"\0\0\0\r",
                    b"\0\0\0\n",
                    4,
                    Decoder::Utf32 { big_endian: true },
                ),
                other => match Encoding::for_label(other.as_bytes()) {
                    Some(enc) => (b"\r", b"\n", 1, Decoder::Label(enc)),
                    None => {
                        return Err(Error::Config(format!("Unsupported encoding \"{name}\"")));
                    }
                },
            };

        Ok(Self {
            name: upper,
            cr,
            lf,
            width,
            decoder,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes per character of the terminator patterns.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn cr(&self) -> &[u8] {
        self.cr
    }

    pub fn lf(&self) -> &[u8] {
        self.lf
    }

    /// Find the first line terminator at or after `start`.
    ///
    /// Returns the offset where the line ends and the offset where the next line
    /// starts. CR, LF and CRLF are recognized. NUL characters met on the way are
    /// replaced with `?` in place.
    pub fn find_newline(&self, buf: &mut [u8], start: usize) -> Option<(usize, usize)> {
        let end = buf.len();

        if self.width == 1 {
            let mut p = start;
            while p < end {
                match buf[p] {
                    0 => buf[p] = b'?',
                    b'\n' => return Some((p, p + 1)),
                    b'\r' => {
                        if p + 1 < end && buf[p + 1] == b'\n' {
                            return Some((p, p + 2));
                        }
                        return Some((p, p + 1));
                    }
                    _ => {}
                }
                p += 1;
            }
            return None;
        }

        let w = self.width;
        let mut p = start;
        while p + w <= end {
            if w == 2 && buf[p] == 0 && buf[p + 1] == 0 {
                if self.cr[0] == 0 {
                    buf[p + 1] = b'?';
                } else {
                    buf[p] = b'?';
                }
            }

            if &buf[p..p + w] == self.lf {
                return Some((p, p + w));
            }

            if &buf[p..p + w] == self.cr {
                if p + 2 * w <= end && &buf[p + w..p + 2 * w] == self.lf {
                    return Some((p, p + 2 * w));
                }
                return Some((p, p + w));
            }

            p += w;
        }
        None
    }

    /// Convert one line to UTF-8. Undecodable input is replaced with U+FFFD.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self.decoder {
            Decoder::Raw => String::from_utf8_lossy(bytes),
            Decoder::Label(enc) => enc.decode_without_bom_handling(bytes).0,
            Decoder::Utf32 { big_endian } => {
                let mut out = String::with_capacity(bytes.len() / 4);
                let chunks = bytes.chunks_exact(4);
                let trailing = !chunks.remainder().is_empty();

                for c in chunks {
                    let raw = [c[0], c[1], c[2], c[3]];
                    let cp = if big_endian {
                        u32::from_be_bytes(raw)
                    } else {
                        u32::from_le_bytes(raw)
                    };
                    out.push(char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                if trailing {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
                Cow::Owned(out)
            }
        }
    }
}
