//! HTTP/1.x request-head helpers
//!
//! Only the bits the fragmenter and the header randomizer need: where the head
//! ends, where each header line sits, and where `Host:` starts.

use std::ops::Range;

/// One header line within a request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    /// Whole line without its terminator
    pub line: Range<usize>,
    /// Header name (before the colon)
    pub name: Range<usize>,
    /// Offset of the colon
    pub colon: usize,
    /// Terminator length: 2 for CRLF, 1 for bare LF, 0 for an unterminated last line
    pub terminator: usize,
}

/// Parsed layout of an HTTP request head
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request line without its terminator
    pub request_line: Range<usize>,
    /// Method token
    pub method: Range<usize>,
    pub headers: Vec<HeaderLine>,
    /// Offset just past the blank line, or the input length when the head is incomplete
    pub head_end: usize,
    /// Whether the blank line terminating the head was seen
    pub complete: bool,
}

impl RequestHead {
    /// Split a request head into lines
    ///
    /// Returns `None` when there is no request line at all. Lines without a
    /// colon are skipped rather than rejected.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (first, first_term) = next_line(data, 0)?;
        let method_end = data[first.clone()]
            .iter()
            .position(|&b| b == b' ')
            .map(|p| first.start + p)?;

        let mut headers = Vec::new();
        let mut pos = first.end + first_term;
        let mut complete = false;

        while pos < data.len() {
            let Some((line, term)) = next_line(data, pos) else {
                break;
            };
            if line.is_empty() && term > 0 {
                pos += term;
                complete = true;
                break;
            }
            if let Some(colon) = data[line.clone()].iter().position(|&b| b == b':') {
                headers.push(HeaderLine {
                    name: line.start..line.start + colon,
                    colon: line.start + colon,
                    line: line.clone(),
                    terminator: term,
                });
            }
            pos = line.end + term;
            if term == 0 {
                break;
            }
        }

        Some(Self {
            request_line: first,
            method: 0..method_end,
            headers,
            head_end: pos.min(data.len()),
            complete,
        })
    }

    /// Find a header by case-insensitive name
    pub fn header<'h>(&'h self, data: &[u8], name: &str) -> Option<&'h HeaderLine> {
        self.headers
            .iter()
            .find(|h| data[h.name.clone()].eq_ignore_ascii_case(name.as_bytes()))
    }
}

/// Next line starting at `start`: (range without terminator, terminator length)
fn next_line(data: &[u8], start: usize) -> Option<(Range<usize>, usize)> {
    if start >= data.len() {
        return None;
    }
    match data[start..].iter().position(|&b| b == b'\n') {
        Some(p) => {
            let lf = start + p;
            if lf > start && data[lf - 1] == b'\r' {
                Some((start..lf - 1, 2))
            } else {
                Some((start..lf, 1))
            }
        }
        None => Some((start..data.len(), 0)),
    }
}

/// Offset of the `Host:` header name
///
/// Matches case-insensitively, only at the start of a line after the request
/// line, so a `Host:` inside a path or another header value is not picked up.
pub fn find_host_header(data: &[u8]) -> Option<usize> {
    const NEEDLE: &[u8] = b"host:";

    let mut pos = data.iter().position(|&b| b == b'\n')? + 1;
    while pos + NEEDLE.len() <= data.len() {
        let rest = &data[pos..];
        if rest[..NEEDLE.len()].eq_ignore_ascii_case(NEEDLE) {
            return Some(pos);
        }
        // Blank line ends the head
        if rest.starts_with(b"\r\n") || rest.starts_with(b"\n") {
            return None;
        }
        pos += rest.iter().position(|&b| b == b'\n')? + 1;
    }
    None
}

/// Offset just past the `\r\n\r\n` that ends the head
pub fn header_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}
