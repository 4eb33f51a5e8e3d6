//! HTTP header case and whitespace randomization

use shroud_protocol::RequestHead;

/// Randomizes letter case of header names (and optionally the method) and
/// pads the optional whitespace after header colons
///
/// Only the request head is touched; a body following the blank line is
/// copied unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRandomizer {
    /// Randomize header name case
    pub randomize_case: bool,
    /// Also randomize the request method (only for peers that accept it)
    pub randomize_method: bool,
    /// Insert 1-3 extra spaces after each header colon
    pub extra_whitespace: bool,
}

impl Default for HeaderRandomizer {
    fn default() -> Self {
        Self {
            randomize_case: true,
            randomize_method: false,
            extra_whitespace: false,
        }
    }
}

impl HeaderRandomizer {
    pub fn is_noop(&self) -> bool {
        !self.randomize_case && !self.randomize_method && !self.extra_whitespace
    }

    /// Whether the output has the same length and layout as the input
    pub fn preserves_length(&self) -> bool {
        !self.extra_whitespace
    }

    /// Apply to a request; `None` when the input has no parseable request line
    pub fn apply(&self, request: &[u8]) -> Option<Vec<u8>> {
        let head = RequestHead::parse(request)?;
        let mut out = Vec::with_capacity(request.len() + head.headers.len() * 3);

        if self.randomize_method {
            out.extend(request[head.method.clone()].iter().map(|&b| random_case(b)));
            out.extend_from_slice(&request[head.method.end..head.request_line.end]);
        } else {
            out.extend_from_slice(&request[..head.request_line.end]);
        }
        let mut pos = head.request_line.end;

        for header in &head.headers {
            // Terminators and skipped lines between headers
            out.extend_from_slice(&request[pos..header.name.start]);

            if self.randomize_case {
                out.extend(request[header.name.clone()].iter().map(|&b| random_case(b)));
            } else {
                out.extend_from_slice(&request[header.name.clone()]);
            }
            out.push(b':');

            if self.extra_whitespace {
                out.extend(std::iter::repeat_n(b' ', fastrand::usize(1..=3)));
            }

            pos = header.colon + 1;
        }

        out.extend_from_slice(&request[pos..]);
        Some(out)
    }
}

/// Flip an ASCII letter to upper or lower case with equal probability
fn random_case(b: u8) -> u8 {
    if !b.is_ascii_alphabetic() {
        return b;
    }
    if fastrand::bool() {
        b.to_ascii_uppercase()
    } else {
        b.to_ascii_lowercase()
    }
}
