//! ClientHello extension reordering and RFC 7685 padding

use shroud_protocol::{ClientHello, EXT_PADDING, EXT_PRE_SHARED_KEY, EXT_SERVER_NAME, raw_extension};
use tracing::trace;

use crate::error::ObfuscationError;

/// Largest TLS plaintext record body
const MAX_RECORD_BODY: usize = 16384;

/// Reorders extensions and appends a padding extension
#[derive(Debug, Clone)]
pub struct TlsExtensionShaper {
    shuffle: bool,
    padding: Option<(usize, usize)>,
}

impl Default for TlsExtensionShaper {
    fn default() -> Self {
        Self {
            shuffle: true,
            padding: Some((100, 300)),
        }
    }
}

impl TlsExtensionShaper {
    /// `padding` is the inclusive body size range of the padding extension
    pub fn new(shuffle: bool, padding: Option<(usize, usize)>) -> Result<Self, ObfuscationError> {
        if let Some((min, max)) = padding {
            if min > max {
                return Err(ObfuscationError::InvalidRange {
                    what: "tls padding",
                    min: min as u64,
                    max: max as u64,
                });
            }
        }
        Ok(Self { shuffle, padding })
    }

    pub fn is_noop(&self) -> bool {
        !self.shuffle && self.padding.is_none()
    }

    /// Rewrite a ClientHello record
    ///
    /// server_name stays first and pre_shared_key stays last, as peers require.
    /// Returns `None` when the input does not parse or carries no extensions.
    pub fn apply(&self, record: &[u8]) -> Option<Vec<u8>> {
        let hello = ClientHello::parse(record).ok()?;
        if hello.extensions_offset().is_none() {
            return None;
        }

        let mut head = Vec::new();
        let mut middle = Vec::new();
        let mut tail = Vec::new();

        for ext in hello.extensions() {
            let bytes = hello.extension_bytes(ext);
            match ext.kind {
                EXT_SERVER_NAME if head.is_empty() => head.push(bytes.to_vec()),
                EXT_PRE_SHARED_KEY => tail.push(bytes.to_vec()),
                EXT_PADDING if self.padding.is_some() => {}
                _ => middle.push(bytes.to_vec()),
            }
        }

        if self.shuffle {
            fastrand::shuffle(&mut middle);
        }

        if let Some((min, max)) = self.padding {
            let current = hello.record_len() - 5 - removed_padding(&hello);
            let size = fastrand::usize(min..=max);
            if current + 4 + size <= MAX_RECORD_BODY {
                trace!("Padding ClientHello with {} bytes", size);
                middle.push(raw_extension(EXT_PADDING, &vec![0u8; size]));
            }
        }

        hello.rebuild(head.into_iter().chain(middle).chain(tail)).ok()
    }
}

fn removed_padding(hello: &ClientHello<'_>) -> usize {
    hello
        .extensions()
        .iter()
        .filter(|e| e.kind == EXT_PADDING)
        .map(|e| e.len + 4)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_protocol::testing::ClientHelloBuilder;

    fn sample() -> Vec<u8> {
        ClientHelloBuilder::new()
            .server_name("example.com")
            .extension(0x000a, &[0x00, 0x02, 0x00, 0x1d])
            .extension(0x000b, &[0x01, 0x00])
            .extension(0x000d, &[0x00, 0x02, 0x04, 0x03])
            .extension(0x002b, &[0x02, 0x03, 0x04])
            .extension(0x0033, &[0x00, 0x00])
            .extension(EXT_PRE_SHARED_KEY, &[0xaa; 8])
            .build()
    }

    fn kinds(data: &[u8]) -> Vec<u16> {
        ClientHello::parse(data)
            .unwrap()
            .extensions()
            .iter()
            .map(|e| e.kind)
            .collect()
    }

    #[test]
    fn test_sni_first_psk_last() {
        let shaper = TlsExtensionShaper::new(true, None).unwrap();
        let original = sample();

        for _ in 0..50 {
            let out = shaper.apply(&original).unwrap();
            let order = kinds(&out);

            assert_eq!(out.len(), original.len());
            assert_eq!(order[0], EXT_SERVER_NAME);
            assert_eq!(*order.last().unwrap(), EXT_PRE_SHARED_KEY);

            let mut sorted = order.clone();
            sorted.sort();
            let mut expected = kinds(&original);
            expected.sort();
            assert_eq!(sorted, expected);
        }
    }

    #[test]
    fn test_shuffle_changes_order() {
        let shaper = TlsExtensionShaper::new(true, None).unwrap();
        let original = sample();
        let changed = (0..50).any(|_| kinds(&shaper.apply(&original).unwrap()) != kinds(&original));
        assert!(changed);
    }

    #[test]
    fn test_padding_extension() {
        let shaper = TlsExtensionShaper::new(false, Some((100, 300))).unwrap();
        let original = sample();

        let out = shaper.apply(&original).unwrap();
        let hello = ClientHello::parse(&out).unwrap();
        let padding = hello.extension(EXT_PADDING).unwrap();

        assert!((100..=300).contains(&padding.len));
        assert_eq!(out.len(), original.len() + 4 + padding.len);
        assert_eq!(hello.server_name(), Some("example.com"));
        assert_eq!(hello.extensions().last().unwrap().kind, EXT_PRE_SHARED_KEY);
    }

    #[test]
    fn test_existing_padding_replaced() {
        let original = ClientHelloBuilder::new()
            .server_name("example.com")
            .extension(EXT_PADDING, &[0u8; 50])
            .build();
        let shaper = TlsExtensionShaper::new(false, Some((10, 10))).unwrap();

        let out = shaper.apply(&original).unwrap();
        let hello = ClientHello::parse(&out).unwrap();
        let paddings: Vec<_> = hello
            .extensions()
            .iter()
            .filter(|e| e.kind == EXT_PADDING)
            .collect();

        assert_eq!(paddings.len(), 1);
        assert_eq!(paddings[0].len, 10);
    }

    #[test]
    fn test_not_a_hello() {
        assert!(TlsExtensionShaper::default().apply(b"GET / HTTP/1.1\r\n").is_none());
        let bare = ClientHelloBuilder::new().no_extensions().build();
        assert!(TlsExtensionShaper::default().apply(&bare).is_none());
    }

    #[test]
    fn test_invalid_range() {
        assert!(TlsExtensionShaper::new(true, Some((300, 100))).is_err());
    }
}
