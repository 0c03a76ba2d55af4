//! Byte-level parsing primitives for AT responses.
//!
//! These operate directly against a [`RingBuf`] by offset, rather than
//! copying whole lines out first, so a response_start/read_*/response_stop
//! sequence only ever copies the bytes an argument actually needs.

use crate::ringbuf::RingBuf;

pub const DEFAULT_DELIMITER: u8 = b',';
pub const DEFAULT_TERMINATOR: u8 = b'\r';

/// Where a response ended: a plain `OK`, a device-reported error, or an
/// aborted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopTag {
    Ok,
    Error,
    CmeError(Option<u16>),
    CmsError(Option<u16>),
    Aborted,
}

/// Scans from `from` (an offset past the buffer's current read position)
/// for the start of the next unquoted `\r\n`. A `\r\n` inside a
/// double-quoted string is not a line terminator -- some modules embed raw
/// line breaks in quoted string fields (e.g. operator names), and those
/// must survive intact rather than splitting the response.
///
/// Returns the offset of the `\r` if found, or `None` if the data seen so
/// far doesn't contain a complete line (the caller should wait for more
/// bytes, up to its timeout).
pub fn find_line_end<const N: usize>(rb: &RingBuf<N>, from: usize) -> Option<usize> {
    let avail = rb.available();
    let mut in_quotes = false;
    let mut i = from;
    while i + 1 < avail {
        let b = rb.peek_byte(i)?;
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if !in_quotes && b == b'\r' {
            if rb.peek_byte(i + 1) == Some(b'\n') {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Scans for a line starting with `prefix` at offset 0 of the unconsumed
/// data, among complete lines only. Returns `(line_start, line_len)` of the
/// matching line's payload (excluding the terminator) if found within the
/// bytes currently buffered, without consuming anything.
///
/// `line_len` counts from the very start of the line (including the prefix
/// itself), so the caller can re-derive where the argument list starts by
/// skipping `prefix.len()`.
pub fn find_prefixed_line<const N: usize>(
    rb: &RingBuf<N>,
    prefix: &[u8],
) -> Option<(usize, usize)> {
    let mut start = skip_leading_crlf(rb, 0);
    loop {
        let end = find_line_end(rb, start)?;
        let len = end - start;
        if len >= prefix.len() && line_starts_with(rb, start, prefix) {
            return Some((start, len));
        }
        // Not a match: move past this line and keep scanning.
        start = end + 2;
    }
}

/// Skips spaces starting at `from` (AT responses conventionally put one
/// after the `:` in a prefix, and after each `,`).
pub fn skip_spaces<const N: usize>(rb: &RingBuf<N>, from: usize) -> usize {
    let mut i = from;
    while rb.peek_byte(i) == Some(b' ') {
        i += 1;
    }
    i
}

/// Skips `\r\n` pairs (blank lines) starting at `from`.
pub fn skip_leading_crlf<const N: usize>(rb: &RingBuf<N>, from: usize) -> usize {
    let mut i = from;
    while rb.peek_byte(i) == Some(b'\r') && rb.peek_byte(i + 1) == Some(b'\n') {
        i += 2;
    }
    i
}

fn line_starts_with<const N: usize>(rb: &RingBuf<N>, start: usize, prefix: &[u8]) -> bool {
    for (i, &b) in prefix.iter().enumerate() {
        if rb.peek_byte(start + i) != Some(b) {
            return false;
        }
    }
    true
}

/// Classifies the line at `[start, start+len)` as a stop tag, if it is one.
pub fn classify_stop_tag<const N: usize>(rb: &RingBuf<N>, start: usize, len: usize) -> Option<StopTag> {
    let mut buf = [0u8; 32];
    let n = rb.peek_at(start, &mut buf[..len.min(32)]);
    let line = &buf[..n];
    if line == b"OK" {
        Some(StopTag::Ok)
    } else if line == b"ERROR" {
        Some(StopTag::Error)
    } else if line == b"ABORTED" {
        Some(StopTag::Aborted)
    } else if let Some(rest) = line.strip_prefix(b"+CME ERROR: ") {
        Some(StopTag::CmeError(parse_u16(rest)))
    } else if let Some(rest) = line.strip_prefix(b"+CMS ERROR: ") {
        Some(StopTag::CmsError(parse_u16(rest)))
    } else {
        None
    }
}

fn parse_u16(bytes: &[u8]) -> Option<u16> {
    parse_i64(bytes).ok().and_then(|v| u16::try_from(v).ok())
}

/// True if the line at `[start, start+len)` begins with `+` and is not a
/// bracketed continuation of the current response -- i.e. a candidate
/// unsolicited result code.
pub fn looks_like_urc<const N: usize>(rb: &RingBuf<N>, start: usize) -> bool {
    rb.peek_byte(start) == Some(b'+')
}

/// Parses a signed decimal integer, accepting an optional leading sign.
/// Returns `Err` on overflow or if there were no digits at all.
pub fn parse_i64(bytes: &[u8]) -> Result<i64, ()> {
    let mut i = 0;
    let neg = match bytes.first() {
        Some(b'-') => {
            i += 1;
            true
        }
        Some(b'+') => {
            i += 1;
            false
        }
        _ => false,
    };
    if i == bytes.len() {
        return Err(());
    }
    let mut value: i64 = 0;
    for &b in &bytes[i..] {
        if !b.is_ascii_digit() {
            return Err(());
        }
        let digit = (b - b'0') as i64;
        value = value.checked_mul(10).ok_or(())?;
        value = value.checked_add(digit).ok_or(())?;
    }
    Ok(if neg { -value } else { value })
}

/// Strips one layer of surrounding double quotes, if present on both ends.
pub fn strip_quotes(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        &bytes[1..bytes.len() - 1]
    } else {
        bytes
    }
}

/// Finds the end of the next token starting at `from`, bounded by `delim`,
/// a stop tag terminator (`\r` if `stop_on_cr`), or `limit` (exclusive).
/// Returns the token's exclusive end offset.
pub fn find_token_end<const N: usize>(
    rb: &RingBuf<N>,
    from: usize,
    delim: u8,
    limit: usize,
    stop_on_cr: bool,
) -> usize {
    let mut i = from;
    let mut in_quotes = false;
    while i < limit {
        match rb.peek_byte(i) {
            Some(b'"') => {
                in_quotes = !in_quotes;
                i += 1;
            }
            Some(b) if !in_quotes && b == delim => break,
            Some(b'\r') if !in_quotes && stop_on_cr => break,
            Some(_) => i += 1,
            None => break,
        }
    }
    i
}
