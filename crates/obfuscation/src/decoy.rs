//! Decoy HTTP headers that vary request shape and size

use shroud_protocol::RequestHead;

/// Kinds of harmless header a request may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoyHeader {
    ForwardedFor,
    RealIp,
    OriginatingIp,
    RemoteIp,
    ClientIp,
    ForwardedProto,
    RequestedWith,
    CacheControl,
    Pragma,
    Dnt,
    UpgradeInsecureRequests,
    CustomToken,
}

impl DecoyHeader {
    pub const ALL: [DecoyHeader; 12] = [
        Self::ForwardedFor,
        Self::RealIp,
        Self::OriginatingIp,
        Self::RemoteIp,
        Self::ClientIp,
        Self::ForwardedProto,
        Self::RequestedWith,
        Self::CacheControl,
        Self::Pragma,
        Self::Dnt,
        Self::UpgradeInsecureRequests,
        Self::CustomToken,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ForwardedFor => "X-Forwarded-For",
            Self::RealIp => "X-Real-IP",
            Self::OriginatingIp => "X-Originating-IP",
            Self::RemoteIp => "X-Remote-IP",
            Self::ClientIp => "X-Client-IP",
            Self::ForwardedProto => "X-Forwarded-Proto",
            Self::RequestedWith => "X-Requested-With",
            Self::CacheControl => "Cache-Control",
            Self::Pragma => "Pragma",
            Self::Dnt => "DNT",
            Self::UpgradeInsecureRequests => "Upgrade-Insecure-Requests",
            Self::CustomToken => "X-Custom-Header",
        }
    }

    /// Generate a fresh value
    pub fn value(&self) -> String {
        match self {
            Self::ForwardedFor
            | Self::RealIp
            | Self::OriginatingIp
            | Self::RemoteIp
            | Self::ClientIp => random_ip(),
            Self::ForwardedProto => "https".to_string(),
            Self::RequestedWith => "XMLHttpRequest".to_string(),
            Self::CacheControl | Self::Pragma => "no-cache".to_string(),
            Self::Dnt | Self::UpgradeInsecureRequests => "1".to_string(),
            Self::CustomToken => random_token(16),
        }
    }

    /// Full header line without terminator
    pub fn render(&self) -> String {
        format!("{}: {}", self.name(), self.value())
    }
}

/// Inserts a random subset of decoy headers among the real ones
#[derive(Debug, Clone)]
pub struct DecoyHeaders {
    /// Inclusive bounds on how many headers to insert
    pub min_count: usize,
    pub max_count: usize,
}

impl Default for DecoyHeaders {
    fn default() -> Self {
        Self {
            min_count: 1,
            max_count: 4,
        }
    }
}

impl DecoyHeaders {
    /// Pick distinct decoys not already present in the request
    fn pick(&self, request: &[u8], head: &RequestHead) -> Vec<DecoyHeader> {
        let mut candidates: Vec<DecoyHeader> = DecoyHeader::ALL
            .into_iter()
            .filter(|d| head.header(request, d.name()).is_none())
            .collect();
        fastrand::shuffle(&mut candidates);

        let max = self.max_count.min(candidates.len());
        let min = self.min_count.min(max);
        let count = if max > min {
            fastrand::usize(min..=max)
        } else {
            max
        };

        candidates.truncate(count);
        candidates
    }

    /// Insert decoys at random header positions
    ///
    /// Returns `None` when the request has no complete head or no room after
    /// the request line. Header lines use the terminator of the request line.
    pub fn apply(&self, request: &[u8]) -> Option<Vec<u8>> {
        let head = RequestHead::parse(request)?;
        if !head.complete {
            return None;
        }

        let decoys = self.pick(request, &head);
        if decoys.is_empty() {
            return Some(request.to_vec());
        }

        let line_end: &[u8] = if request.get(head.request_line.end) == Some(&b'\r') {
            b"\r\n"
        } else {
            b"\n"
        };

        // Insertion points: start of each header line, plus just before the blank line
        let mut slots: Vec<usize> = Vec::with_capacity(head.headers.len() + 1);
        slots.push(head.request_line.end + line_end.len());
        for header in &head.headers {
            slots.push(header.line.end + header.terminator);
        }

        let mut inserts: Vec<(usize, String)> = decoys
            .iter()
            .map(|d| (slots[fastrand::usize(0..slots.len())], d.render()))
            .collect();
        inserts.sort_by_key(|(at, _)| *at);

        let extra: usize = inserts.iter().map(|(_, l)| l.len() + line_end.len()).sum();
        let mut out = Vec::with_capacity(request.len() + extra);
        let mut pos = 0;
        for (at, line) in inserts {
            out.extend_from_slice(&request[pos..at]);
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(line_end);
            pos = at;
        }
        out.extend_from_slice(&request[pos..]);

        Some(out)
    }
}

fn random_ip() -> String {
    format!(
        "{}.{}.{}.{}",
        fastrand::u8(1..=223),
        fastrand::u8(..),
        fastrand::u8(..),
        fastrand::u8(1..=254)
    )
}

fn random_token(len: usize) -> String {
    (0..len).map(|_| fastrand::alphanumeric()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\nBODY";

    fn header_lines(data: &[u8]) -> Vec<String> {
        let text = String::from_utf8(data.to_vec()).unwrap();
        let head = text.split("\r\n\r\n").next().unwrap().to_string();
        head.split("\r\n").skip(1).map(str::to_string).collect()
    }

    #[test]
    fn test_inserts_between_one_and_four() {
        let decoys = DecoyHeaders::default();

        for _ in 0..100 {
            let out = decoys.apply(REQ).unwrap();
            let lines = header_lines(&out);

            assert!((3..=6).contains(&lines.len()), "{:?}", lines);
            assert!(out.starts_with(b"GET / HTTP/1.1\r\n"));
            assert!(out.ends_with(b"\r\n\r\nBODY"));
            assert!(lines.iter().any(|l| l == "Host: example.com"));
            assert!(lines.iter().any(|l| l == "Accept: */*"));
            // Original order of real headers is kept
            let host = lines.iter().position(|l| l.starts_with("Host")).unwrap();
            let accept = lines.iter().position(|l| l.starts_with("Accept")).unwrap();
            assert!(host < accept);
        }
    }

    #[test]
    fn test_decoys_are_distinct_and_new() {
        let req = b"GET / HTTP/1.1\r\nHost: a\r\nDNT: 1\r\n\r\n";
        let decoys = DecoyHeaders {
            min_count: 11,
            max_count: 11,
        };

        let out = decoys.apply(req).unwrap();
        let lines = header_lines(&out);
        assert_eq!(lines.len(), 13);
        assert_eq!(lines.iter().filter(|l| l.starts_with("DNT:")).count(), 1);
    }

    #[test]
    fn test_incomplete_head_is_skipped() {
        assert!(DecoyHeaders::default().apply(b"GET / HTTP/1.1\r\nHost: a").is_none());
    }

    #[test]
    fn test_render() {
        assert_eq!(DecoyHeader::Pragma.render(), "Pragma: no-cache");
        let ip = DecoyHeader::RealIp.value();
        assert_eq!(ip.split('.').count(), 4);
        assert_eq!(DecoyHeader::CustomToken.value().len(), 16);
    }
}
