//! Payload classification

/// TLS record content type for handshake messages
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Minimum length for a payload to be considered a TLS handshake
pub const MIN_TLS_CLASSIFY_LEN: usize = 6;

/// Request-method prefixes checked byte-for-byte (4 bytes each)
pub const HTTP_METHOD_PREFIXES: [&[u8; 4]; 9] = [
    b"GET ", b"POST", b"HEAD", b"PUT ", b"DELE", b"CONN", b"OPTI", b"TRAC", b"PATC",
];

/// What the first bytes of a logical write look like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// TLS handshake record (TLS 1.0 - 1.3 legacy record version)
    TlsHandshake,
    /// Plaintext HTTP/1.x request
    HttpRequest,
    /// Anything else
    Generic,
}

impl Classification {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::TlsHandshake)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::HttpRequest)
    }

    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TlsHandshake => "tls",
            Self::HttpRequest => "http",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the first bytes of an outbound write
pub fn classify(first_bytes: &[u8]) -> Classification {
    if is_tls_handshake(first_bytes) {
        Classification::TlsHandshake
    } else if is_http_request(first_bytes) {
        Classification::HttpRequest
    } else {
        Classification::Generic
    }
}

/// Record type 0x16, major version 3, minor version 1..=4
pub fn is_tls_handshake(data: &[u8]) -> bool {
    data.len() >= MIN_TLS_CLASSIFY_LEN
        && data[0] == TLS_HANDSHAKE_RECORD
        && data[1] == 0x03
        && (0x01..=0x04).contains(&data[2])
}

/// Byte-prefix match against the known method tokens
pub fn is_http_request(data: &[u8]) -> bool {
    HTTP_METHOD_PREFIXES
        .iter()
        .any(|method| data.starts_with(&method[..]))
}

/// Like [`is_http_request`], but ignores ASCII case in the method token
///
/// Method-case randomization rewrites `GET ` into e.g. `gEt `; anything that
/// inspects a request after obfuscation uses this instead.
pub fn is_http_request_any_case(data: &[u8]) -> bool {
    data.len() >= 4
        && HTTP_METHOD_PREFIXES
            .iter()
            .any(|method| data[..4].eq_ignore_ascii_case(&method[..]))
}

/// Sticky per-stream classification: the first write decides for the whole stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassificationState {
    class: Option<Classification>,
}

impl ClassificationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify on the first call, return the stored tag afterwards
    pub fn observe(&mut self, payload: &[u8]) -> Classification {
        *self.class.get_or_insert_with(|| classify(payload))
    }

    pub fn get(&self) -> Option<Classification> {
        self.class
    }

    pub fn is_classified(&self) -> bool {
        self.class.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_versions() {
        for minor in 0x01..=0x04u8 {
            let data = [0x16, 0x03, minor, 0x00, 0x10, 0x01];
            assert_eq!(classify(&data), Classification::TlsHandshake);
        }

        // SSL 3.0 and an unknown future version are not recognized
        assert_eq!(classify(&[0x16, 0x03, 0x00, 0x00, 0x10, 0x01]), Classification::Generic);
        assert_eq!(classify(&[0x16, 0x03, 0x05, 0x00, 0x10, 0x01]), Classification::Generic);
    }

    #[test]
    fn test_http_method_case() {
        assert!(!is_http_request(b"gEt / HTTP/1.1\r\n"));
        assert!(is_http_request_any_case(b"gEt / HTTP/1.1\r\n"));
        assert!(is_http_request_any_case(b"pOsT /api HTTP/1.1\r\n"));
        assert!(!is_http_request_any_case(b"GE"));
        assert!(!is_http_request_any_case(b"GETX / HTTP/1.1\r\n"));
    }

    #[test]
    fn test_tls_too_short() {
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x00, 0x10]), Classification::Generic);
        assert_eq!(classify(&[]), Classification::Generic);
    }

    #[test]
    fn test_http_methods() {
        let requests: [&[u8]; 9] = [
            b"GET / HTTP/1.1\r\n",
            b"POST /api HTTP/1.1\r\n",
            b"HEAD / HTTP/1.1\r\n",
            b"PUT /x HTTP/1.1\r\n",
            b"DELETE /x HTTP/1.1\r\n",
            b"CONNECT example.com:443 HTTP/1.1\r\n",
            b"OPTIONS * HTTP/1.1\r\n",
            b"TRACE / HTTP/1.1\r\n",
            b"PATCH /x HTTP/1.1\r\n",
        ];

        for req in requests {
            assert_eq!(classify(req), Classification::HttpRequest, "{:?}", req);
        }
    }

    #[test]
    fn test_http_prefix_is_case_sensitive() {
        assert_eq!(classify(b"get / HTTP/1.1\r\n"), Classification::Generic);
        assert_eq!(classify(b"GETX"), Classification::Generic);
        assert_eq!(classify(b"GE"), Classification::Generic);
    }

    #[test]
    fn test_generic() {
        assert_eq!(classify(b"SSH-2.0-OpenSSH"), Classification::Generic);
        assert_eq!(classify(&[0x17, 0x03, 0x03, 0x00, 0x10, 0x00]), Classification::Generic);
    }

    #[test]
    fn test_random_bytes_never_panic() {
        for _ in 0..1000 {
            let len = fastrand::usize(0..32);
            let data: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
            let _ = classify(&data);
        }
    }

    #[test]
    fn test_state_is_sticky() {
        let mut state = ClassificationState::new();
        assert!(!state.is_classified());

        assert_eq!(state.observe(b"GET / HTTP/1.1\r\n"), Classification::HttpRequest);
        assert_eq!(
            state.observe(&[0x16, 0x03, 0x01, 0x00, 0x10, 0x01]),
            Classification::HttpRequest
        );
        assert_eq!(state.get(), Some(Classification::HttpRequest));
    }
}
