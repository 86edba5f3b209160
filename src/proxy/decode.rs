use std::borrow::Cow;
use std::io::Read;

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};

use crate::error::{ProxyError, Result};

/// Transfer codings the decoder can reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Gzip,
    Deflate,
    Brotli,
    Identity,
}

impl Coding {
    fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Coding::Gzip),
            "deflate" => Some(Coding::Deflate),
            "br" => Some(Coding::Brotli),
            "identity" | "" => Some(Coding::Identity),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Coding::Gzip => "gzip",
            Coding::Deflate => "deflate",
            Coding::Brotli => "br",
            Coding::Identity => "identity",
        }
    }
}

/// Result of decoding a body.
#[derive(Debug)]
pub enum Decoded<'a> {
    /// Codings were reversed, or there were none to reverse.
    Plain(Cow<'a, [u8]>),
    /// The header names a coding this decoder does not know.
    Unrecognized { coding: String },
    /// The decoded body would exceed the size limit.
    Oversized { limit: usize },
}

/// Reverse the `Content-Encoding` applied to `body`, producing at most
/// `limit` bytes.
///
/// Multiple codings (`gzip, br`) are undone in reverse order of
/// application.
pub fn decode_body<'a>(body: &'a [u8], content_encoding: Option<&str>, limit: usize) -> Result<Decoded<'a>> {
    let Some(header) = content_encoding else {
        return Ok(Decoded::Plain(Cow::Borrowed(body)));
    };

    let mut codings = Vec::new();
    for token in header.split(',') {
        match Coding::from_token(token) {
            Some(Coding::Identity) => {}
            Some(coding) => codings.push(coding),
            None => {
                return Ok(Decoded::Unrecognized {
                    coding: token.trim().to_string(),
                })
            }
        }
    }

    let mut current = Cow::Borrowed(body);
    for coding in codings.into_iter().rev() {
        match decode_one(&current, coding, limit)? {
            Some(decoded) => current = Cow::Owned(decoded),
            None => return Ok(Decoded::Oversized { limit }),
        }
    }
    Ok(Decoded::Plain(current))
}

/// Decode one layer. `None` when the output exceeds `limit`.
fn decode_one(body: &[u8], coding: Coding, limit: usize) -> Result<Option<Vec<u8>>> {
    // One byte past the limit tells an exact fit from an overflow.
    let cap = limit as u64 + 1;
    let mut out = Vec::with_capacity(body.len().saturating_mul(4).min(limit + 1));
    let outcome = match coding {
        Coding::Gzip => MultiGzDecoder::new(body).take(cap).read_to_end(&mut out),
        Coding::Deflate => {
            // "deflate" is specified as zlib-wrapped, but raw streams are common.
            match ZlibDecoder::new(body).take(cap).read_to_end(&mut out) {
                Ok(n) => Ok(n),
                Err(_) => {
                    out.clear();
                    DeflateDecoder::new(body).take(cap).read_to_end(&mut out)
                }
            }
        }
        Coding::Brotli => brotli::Decompressor::new(body, 4096).take(cap).read_to_end(&mut out),
        Coding::Identity => {
            out.extend_from_slice(body);
            Ok(out.len())
        }
    };

    outcome.map_err(|e| ProxyError::Decode {
        encoding: coding.name().to_string(),
        reason: e.to_string(),
    })?;

    if out.len() > limit {
        return Ok(None);
    }
    Ok(Some(out))
}
