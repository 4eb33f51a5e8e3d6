//! TLS ClientHello inspection
//!
//! A `ClientHello` borrows the record bytes and records where things are:
//! the extensions block, every extension, and the SNI hostname. Offsets are
//! absolute positions within the original buffer so the fragmenter can use
//! them directly as split hints.

use std::ops::Range;

use thiserror::Error;

use crate::classify::is_tls_handshake;

/// TLS record header: type(1) + version(2) + length(2)
pub const RECORD_HEADER_LEN: usize = 5;

/// Handshake header: type(1) + length(3)
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Handshake message type for ClientHello
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// server_name extension
pub const EXT_SERVER_NAME: u16 = 0x0000;

/// RFC 7685 padding extension
pub const EXT_PADDING: u16 = 0x0015;

/// pre_shared_key must stay the last extension when present
pub const EXT_PRE_SHARED_KEY: u16 = 0x0029;

/// SNI name type for DNS hostnames
const SNI_HOST_NAME: u8 = 0x00;

/// Offset of the session id length byte in a ClientHello record
/// (record header + handshake header + client_version + random)
const SESSION_ID_OFFSET: usize = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + 2 + 32;

/// ClientHello parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Not a TLS handshake record")]
    NotHandshake,

    #[error("Not a ClientHello (handshake type {0:#04x})")]
    NotClientHello(u8),

    #[error("Truncated at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Length mismatch in {field}: declared {declared}, actual {actual}")]
    LengthMismatch {
        field: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("Malformed server_name extension")]
    MalformedSni,
}

/// One extension inside a ClientHello
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    /// Extension type
    pub kind: u16,
    /// Offset of the 4-byte extension header
    pub offset: usize,
    /// Length of the extension body
    pub len: usize,
}

impl Extension {
    /// Full range including the 4-byte header
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + 4 + self.len
    }

    /// Body range, excluding the header
    pub fn body(&self) -> Range<usize> {
        self.offset + 4..self.offset + 4 + self.len
    }
}

/// Parsed view over a ClientHello record
#[derive(Debug, Clone)]
pub struct ClientHello<'a> {
    data: &'a [u8],
    record_end: usize,
    /// End of the ClientHello message; anything up to `record_end` is another message
    handshake_end: usize,
    extensions_offset: Option<usize>,
    extensions: Vec<Extension>,
    sni: Option<Range<usize>>,
}

impl<'a> ClientHello<'a> {
    /// Parse the first TLS record of `data` as a ClientHello
    ///
    /// Bytes after the first record are ignored but preserved by `rebuild`.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if !is_tls_handshake(data) {
            return Err(ParseError::NotHandshake);
        }

        let mut r = Reader::new(data, RECORD_HEADER_LEN);
        let record_len = read_u16(data, 3)? as usize;
        let record_end = RECORD_HEADER_LEN + record_len;
        if data.len() < record_end {
            return Err(ParseError::Truncated {
                offset: RECORD_HEADER_LEN,
                needed: record_len,
                available: data.len() - RECORD_HEADER_LEN,
            });
        }
        r.limit = record_end;

        let msg_type = r.u8()?;
        if msg_type != HANDSHAKE_CLIENT_HELLO {
            return Err(ParseError::NotClientHello(msg_type));
        }

        let hs_len = r.u24()?;
        let hs_end = r.pos + hs_len;
        if hs_end > record_end {
            return Err(ParseError::LengthMismatch {
                field: "handshake",
                declared: hs_len,
                actual: record_end - r.pos,
            });
        }
        r.limit = hs_end;

        // client_version + random
        r.skip(2 + 32)?;
        debug_assert_eq!(r.pos, SESSION_ID_OFFSET);

        let session_len = r.u8()? as usize;
        r.skip(session_len)?;

        let suites_len = r.u16()? as usize;
        r.skip(suites_len)?;

        let compression_len = r.u8()? as usize;
        r.skip(compression_len)?;

        // Extensions are optional in old ClientHellos
        if r.remaining() == 0 {
            return Ok(Self {
                data,
                record_end,
                handshake_end: hs_end,
                extensions_offset: None,
                extensions: Vec::new(),
                sni: None,
            });
        }

        let extensions_offset = r.pos;
        let ext_total = r.u16()? as usize;
        if ext_total != r.remaining() {
            return Err(ParseError::LengthMismatch {
                field: "extensions",
                declared: ext_total,
                actual: r.remaining(),
            });
        }

        let mut extensions = Vec::new();
        let mut sni = None;

        while r.remaining() > 0 {
            let offset = r.pos;
            let kind = r.u16()?;
            let len = r.u16()? as usize;
            r.skip(len)?;

            let ext = Extension { kind, offset, len };
            if kind == EXT_SERVER_NAME && sni.is_none() {
                sni = parse_sni(data, ext.body())?;
            }
            extensions.push(ext);
        }

        Ok(Self {
            data,
            record_end,
            handshake_end: hs_end,
            extensions_offset: Some(extensions_offset),
            extensions,
            sni,
        })
    }

    /// The underlying bytes (whole input, not only the record)
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Total record length including the 5-byte header
    pub fn record_len(&self) -> usize {
        self.record_end
    }

    /// Offset of the 2-byte extensions length field, if the hello has extensions
    pub fn extensions_offset(&self) -> Option<usize> {
        self.extensions_offset
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn extension(&self, kind: u16) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.kind == kind)
    }

    /// Bytes of one extension, header included
    pub fn extension_bytes(&self, ext: &Extension) -> &'a [u8] {
        &self.data[ext.range()]
    }

    /// Absolute byte range of the SNI hostname
    pub fn sni_range(&self) -> Option<Range<usize>> {
        self.sni.clone()
    }

    /// SNI hostname, if present and valid UTF-8
    pub fn server_name(&self) -> Option<&'a str> {
        let range = self.sni.clone()?;
        std::str::from_utf8(&self.data[range]).ok()
    }

    /// Reassemble the record with a new extension list
    ///
    /// Each entry is a complete extension (4-byte header + body). The record,
    /// handshake and extensions length fields are recomputed. Any further
    /// handshake bytes inside the record, and bytes that followed the record
    /// in the input, are kept unchanged.
    pub fn rebuild<I, E>(&self, extensions: I) -> Result<Vec<u8>, ParseError>
    where
        I: IntoIterator<Item = E>,
        E: AsRef<[u8]>,
    {
        let Some(ext_offset) = self.extensions_offset else {
            return Err(ParseError::Truncated {
                offset: self.record_end,
                needed: 2,
                available: 0,
            });
        };

        let mut out = Vec::with_capacity(self.data.len() + 512);
        out.extend_from_slice(&self.data[..ext_offset]);
        out.extend_from_slice(&[0, 0]);
        for ext in extensions {
            out.extend_from_slice(ext.as_ref());
        }

        let ext_total = out.len() - ext_offset - 2;
        let hs_len = out.len() - RECORD_HEADER_LEN - HANDSHAKE_HEADER_LEN;
        out.extend_from_slice(&self.data[self.handshake_end..self.record_end]);
        let record_len = out.len() - RECORD_HEADER_LEN;

        if record_len > u16::MAX as usize {
            return Err(ParseError::LengthMismatch {
                field: "record",
                declared: record_len,
                actual: u16::MAX as usize,
            });
        }

        write_u16(&mut out, ext_offset, ext_total as u16);
        write_u16(&mut out, 3, record_len as u16);
        write_u24(&mut out, RECORD_HEADER_LEN + 1, hs_len);

        out.extend_from_slice(&self.data[self.record_end..]);
        Ok(out)
    }
}

/// Locate the first host_name entry inside a server_name extension body
fn parse_sni(data: &[u8], body: Range<usize>) -> Result<Option<Range<usize>>, ParseError> {
    if body.is_empty() {
        // Empty server_name is legal in a ServerHello echo, treat as absent
        return Ok(None);
    }

    let mut r = Reader::new(data, body.start);
    r.limit = body.end;

    let list_len = r.u16().map_err(|_| ParseError::MalformedSni)? as usize;
    if list_len != r.remaining() {
        return Err(ParseError::MalformedSni);
    }

    while r.remaining() > 0 {
        let name_type = r.u8().map_err(|_| ParseError::MalformedSni)?;
        let name_len = r.u16().map_err(|_| ParseError::MalformedSni)? as usize;
        let start = r.pos;
        r.skip(name_len).map_err(|_| ParseError::MalformedSni)?;

        if name_type == SNI_HOST_NAME && name_len > 0 {
            return Ok(Some(start..start + name_len));
        }
    }

    Ok(None)
}

/// Build a complete server_name extension for one hostname
pub fn server_name_extension(host: &[u8]) -> Vec<u8> {
    let name_len = host.len();
    let list_len = name_len + 3;
    let ext_len = list_len + 2;

    let mut ext = Vec::with_capacity(ext_len + 4);
    ext.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    ext.extend_from_slice(&(ext_len as u16).to_be_bytes());
    ext.extend_from_slice(&(list_len as u16).to_be_bytes());
    ext.push(SNI_HOST_NAME);
    ext.extend_from_slice(&(name_len as u16).to_be_bytes());
    ext.extend_from_slice(host);
    ext
}

/// Build an extension from a type and a body
pub fn raw_extension(kind: u16, body: &[u8]) -> Vec<u8> {
    let mut ext = Vec::with_capacity(body.len() + 4);
    ext.extend_from_slice(&kind.to_be_bytes());
    ext.extend_from_slice(&(body.len() as u16).to_be_bytes());
    ext.extend_from_slice(body);
    ext
}

/// Declared TLS record length (header included) from the first 5 bytes
pub fn declared_record_len(data: &[u8]) -> Option<usize> {
    if data.len() < RECORD_HEADER_LEN {
        return None;
    }
    Some(RECORD_HEADER_LEN + u16::from_be_bytes([data[3], data[4]]) as usize)
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, ParseError> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(ParseError::Truncated {
            offset: at,
            needed: 2,
            available: data.len().saturating_sub(at),
        })
}

fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u24(buf: &mut [u8], at: usize, value: usize) {
    buf[at] = (value >> 16) as u8;
    buf[at + 1] = (value >> 8) as u8;
    buf[at + 2] = value as u8;
}

/// Bounds-checked cursor
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos,
            limit: data.len(),
        }
    }

    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, ParseError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ClientHelloBuilder;

    #[test]
    fn test_parse_with_sni() {
        let hello = ClientHelloBuilder::new().server_name("example.com").build();
        let parsed = ClientHello::parse(&hello).unwrap();

        assert_eq!(parsed.record_len(), hello.len());
        assert_eq!(parsed.server_name(), Some("example.com"));

        let range = parsed.sni_range().unwrap();
        assert_eq!(&hello[range], b"example.com");
        assert_eq!(parsed.extensions()[0].kind, EXT_SERVER_NAME);
    }

    #[test]
    fn test_parse_without_sni() {
        let hello = ClientHelloBuilder::new()
            .extension(0x000a, &[0x00, 0x02, 0x00, 0x1d])
            .build();
        let parsed = ClientHello::parse(&hello).unwrap();

        assert!(parsed.sni_range().is_none());
        assert_eq!(parsed.extensions().len(), 1);
        assert!(parsed.extension(0x000a).is_some());
    }

    #[test]
    fn test_parse_no_extensions() {
        let hello = ClientHelloBuilder::new().no_extensions().build();
        let parsed = ClientHello::parse(&hello).unwrap();

        assert!(parsed.extensions_offset().is_none());
        assert!(parsed.rebuild(Vec::<Vec<u8>>::new()).is_err());
    }

    #[test]
    fn test_rejects_non_handshake() {
        assert_eq!(
            ClientHello::parse(b"GET / HTTP/1.1\r\n").unwrap_err(),
            ParseError::NotHandshake
        );
    }

    #[test]
    fn test_rejects_server_hello() {
        let mut hello = ClientHelloBuilder::new().server_name("a.com").build();
        hello[5] = 0x02;
        assert_eq!(
            ClientHello::parse(&hello).unwrap_err(),
            ParseError::NotClientHello(0x02)
        );
    }

    #[test]
    fn test_truncated() {
        let hello = ClientHelloBuilder::new().server_name("example.com").build();
        for cut in [6, 20, 44, hello.len() - 1] {
            assert!(
                matches!(
                    ClientHello::parse(&hello[..cut]),
                    Err(ParseError::Truncated { .. })
                ),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_rebuild_identity() {
        let hello = ClientHelloBuilder::new()
            .server_name("example.com")
            .extension(0x000a, &[0x00, 0x02, 0x00, 0x1d])
            .build();
        let parsed = ClientHello::parse(&hello).unwrap();

        let exts: Vec<&[u8]> = parsed
            .extensions()
            .iter()
            .map(|e| parsed.extension_bytes(e))
            .collect();
        assert_eq!(parsed.rebuild(exts).unwrap(), hello);
    }

    #[test]
    fn test_rebuild_fixes_lengths() {
        let hello = ClientHelloBuilder::new().server_name("example.com").build();
        let parsed = ClientHello::parse(&hello).unwrap();

        let rebuilt = parsed
            .rebuild([
                server_name_extension(b"mail.ru"),
                raw_extension(EXT_PADDING, &[0u8; 100]),
            ])
            .unwrap();

        let reparsed = ClientHello::parse(&rebuilt).unwrap();
        assert_eq!(reparsed.server_name(), Some("mail.ru"));
        assert_eq!(reparsed.record_len(), rebuilt.len());
        assert_eq!(reparsed.extension(EXT_PADDING).unwrap().len, 100);
    }

    #[test]
    fn test_trailing_bytes_preserved() {
        let mut data = ClientHelloBuilder::new().server_name("example.com").build();
        let record_len = data.len();
        data.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x01, 0xff]);

        let parsed = ClientHello::parse(&data).unwrap();
        assert_eq!(parsed.record_len(), record_len);

        let exts: Vec<&[u8]> = parsed
            .extensions()
            .iter()
            .map(|e| parsed.extension_bytes(e))
            .collect();
        assert_eq!(parsed.rebuild(exts).unwrap(), data);
    }

    #[test]
    fn test_rebuild_keeps_rest_of_record() {
        let hello = ClientHelloBuilder::new().server_name("example.com").build();
        let hello_len = hello.len();

        // A second handshake message sharing the record
        let tail = [0x0b, 0x00, 0x00, 0x02, 0xaa, 0xbb];
        let mut data = hello;
        data.extend_from_slice(&tail);
        let record_len = (data.len() - RECORD_HEADER_LEN) as u16;
        data[3..5].copy_from_slice(&record_len.to_be_bytes());

        let parsed = ClientHello::parse(&data).unwrap();
        assert_eq!(parsed.record_len(), data.len());

        let rebuilt = parsed
            .rebuild([
                server_name_extension(b"mail.ru"),
                raw_extension(EXT_PADDING, &[0u8; 16]),
            ])
            .unwrap();
        assert!(rebuilt.ends_with(&tail));

        let reparsed = ClientHello::parse(&rebuilt).unwrap();
        assert_eq!(reparsed.server_name(), Some("mail.ru"));
        assert_eq!(reparsed.record_len(), rebuilt.len());
        assert_eq!(reparsed.handshake_end, rebuilt.len() - tail.len());
        assert!(rebuilt.len() > hello_len);
    }

    #[test]
    fn test_declared_record_len() {
        assert_eq!(declared_record_len(&[0x16, 0x03, 0x01, 0x00, 0x78]), Some(125));
        assert_eq!(declared_record_len(&[0x16, 0x03]), None);
    }

    #[test]
    fn test_garbage_never_panics() {
        for _ in 0..2000 {
            let len = fastrand::usize(0..256);
            let mut data: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
            if data.len() >= 6 {
                data[0] = 0x16;
                data[1] = 0x03;
                data[2] = 0x01;
            }
            let _ = ClientHello::parse(&data);
        }
    }
}
