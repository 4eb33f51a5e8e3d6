//! Test helpers for building synthetic ClientHello records

use crate::tls::{EXT_PADDING, raw_extension, server_name_extension};

/// Builder for a minimal but well-formed TLS ClientHello record
///
/// Layout with the defaults: 43 bytes of fixed header, a 32-byte session id,
/// one cipher suite, null compression, then the extensions in insertion order
/// (SNI first when set).
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    record_minor: u8,
    session_id_len: usize,
    cipher_suites: Vec<u16>,
    server_name: Option<String>,
    extensions: Vec<(u16, Vec<u8>)>,
    with_extensions: bool,
    total_len: Option<usize>,
}

impl Default for ClientHelloBuilder {
    fn default() -> Self {
        Self {
            record_minor: 0x01,
            session_id_len: 32,
            cipher_suites: vec![0x1301],
            server_name: None,
            extensions: Vec::new(),
            with_extensions: true,
            total_len: None,
        }
    }
}

impl ClientHelloBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_version(mut self, minor: u8) -> Self {
        self.record_minor = minor;
        self
    }

    pub fn session_id_len(mut self, len: usize) -> Self {
        self.session_id_len = len.min(32);
        self
    }

    pub fn cipher_suites(mut self, suites: &[u16]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    pub fn server_name(mut self, host: &str) -> Self {
        self.server_name = Some(host.to_string());
        self
    }

    pub fn extension(mut self, kind: u16, body: &[u8]) -> Self {
        self.extensions.push((kind, body.to_vec()));
        self
    }

    pub fn no_extensions(mut self) -> Self {
        self.with_extensions = false;
        self
    }

    /// Append a padding extension so the record is exactly `len` bytes
    ///
    /// Ignored when the record is already within 4 bytes of `len` or longer.
    pub fn total_len(mut self, len: usize) -> Self {
        self.total_len = Some(len);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(512);

        // client_version
        body.extend_from_slice(&[0x03, 0x03]);
        // random
        body.extend((0..32).map(|i| i as u8));
        // session id
        body.push(self.session_id_len as u8);
        body.extend((0..self.session_id_len).map(|i| 0xa0u8.wrapping_add(i as u8)));
        // cipher suites
        body.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        // compression: null only
        body.extend_from_slice(&[0x01, 0x00]);

        if self.with_extensions {
            let mut exts = Vec::new();
            if let Some(host) = &self.server_name {
                exts.extend_from_slice(&server_name_extension(host.as_bytes()));
            }
            for (kind, ext_body) in &self.extensions {
                exts.extend_from_slice(&raw_extension(*kind, ext_body));
            }

            // record(5) + handshake(4) + body + ext length(2) + exts
            let current = 5 + 4 + body.len() + 2 + exts.len();
            if let Some(target) = self.total_len {
                if target >= current + 4 {
                    let filler = vec![0u8; target - current - 4];
                    exts.extend_from_slice(&raw_extension(EXT_PADDING, &filler));
                }
            }

            body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
            body.extend_from_slice(&exts);
        }

        let hs_len = body.len();
        let record_len = hs_len + 4;

        let mut out = Vec::with_capacity(record_len + 5);
        out.extend_from_slice(&[0x16, 0x03, self.record_minor]);
        out.extend_from_slice(&(record_len as u16).to_be_bytes());
        out.push(0x01);
        out.push((hs_len >> 16) as u8);
        out.push((hs_len >> 8) as u8);
        out.push(hs_len as u8);
        out.extend_from_slice(&body);
        out
    }
}
