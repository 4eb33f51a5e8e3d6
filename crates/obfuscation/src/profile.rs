//! Obfuscation profile and the composed transform pipeline

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shroud_protocol::{Classification, is_http_request, is_tls_handshake};
use tracing::trace;

use crate::decoy::DecoyHeaders;
use crate::entropy::{EntropyConfig, EntropyShaper};
use crate::error::ObfuscationError;
use crate::headers::HeaderRandomizer;
use crate::padding::{PADDING_HEADER_LEN, PaddingConfig, PaddingStrategy};
use crate::sni::{SniMaskMode, SniMasker};
use crate::tls_ext::TlsExtensionShaper;
use crate::whitelist::WhitelistSet;

/// HTTP request transforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpObfuscation {
    pub randomize_case: bool,
    pub randomize_method: bool,
    pub extra_whitespace: bool,
    pub decoy_headers: bool,
    pub decoy_min: usize,
    pub decoy_max: usize,
}

impl Default for HttpObfuscation {
    fn default() -> Self {
        Self {
            randomize_case: true,
            randomize_method: false,
            extra_whitespace: false,
            decoy_headers: true,
            decoy_min: 1,
            decoy_max: 4,
        }
    }
}

/// ClientHello transforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsObfuscation {
    pub shuffle_extensions: bool,
    pub padding_extension: bool,
    pub padding_min: usize,
    pub padding_max: usize,
    pub mask_sni: bool,
    pub sni_mode: SniMaskMode,
}

impl Default for TlsObfuscation {
    fn default() -> Self {
        Self {
            shuffle_extensions: true,
            padding_extension: true,
            padding_min: 100,
            padding_max: 300,
            mask_sni: false,
            sni_mode: SniMaskMode::Fronting,
        }
    }
}

/// Which obfuscation techniques are on, and their ranges
///
/// `enabled` gates the content transforms (HTTP, TLS, entropy). Padding has
/// its own switch since it also changes what the peer must strip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationProfile {
    pub enabled: bool,
    pub padding: PaddingConfig,
    pub http: HttpObfuscation,
    pub tls: TlsObfuscation,
    pub entropy: EntropyConfig,
}

impl ObfuscationProfile {
    pub fn validate(&self) -> Result<(), ObfuscationError> {
        self.padding.validate()?;

        if self.http.decoy_min > self.http.decoy_max {
            return Err(ObfuscationError::InvalidRange {
                what: "decoy header count",
                min: self.http.decoy_min as u64,
                max: self.http.decoy_max as u64,
            });
        }
        if self.tls.padding_min > self.tls.padding_max {
            return Err(ObfuscationError::InvalidRange {
                what: "tls padding",
                min: self.tls.padding_min as u64,
                max: self.tls.padding_max as u64,
            });
        }
        if self.entropy.enabled {
            EntropyShaper::new(&self.entropy)?;
        }
        Ok(())
    }
}

/// Maps a count of output bytes back to input bytes for one transform stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetMap {
    /// Same layout as the input
    Identity,
    /// `prefix` bytes of header, then the `len` input bytes, then trailer
    Prefixed { prefix: usize, len: usize },
    /// `pattern` bytes inserted after every `block` input bytes
    Interleaved {
        block: usize,
        pattern: usize,
        len: usize,
    },
    /// Rewritten as a whole: only a fully flushed output accounts for the input
    Opaque { len: usize, output_len: usize },
}

impl OffsetMap {
    pub fn original(&self, flushed: usize) -> usize {
        match *self {
            Self::Identity => flushed,
            Self::Prefixed { prefix, len } => flushed.saturating_sub(prefix).min(len),
            Self::Interleaved {
                block,
                pattern,
                len,
            } => {
                let stride = block + pattern;
                let full = flushed / stride;
                let rem = flushed % stride;
                (full * block + rem.min(block)).min(len)
            }
            Self::Opaque { len, output_len } => {
                if flushed >= output_len {
                    len
                } else {
                    0
                }
            }
        }
    }
}

/// Output of the pipeline for one payload
#[derive(Debug, Clone)]
pub struct Obfuscated<'a> {
    pub data: Cow<'a, [u8]>,
    original_len: usize,
    stages: Vec<OffsetMap>,
}

impl<'a> Obfuscated<'a> {
    fn passthrough(payload: &'a [u8]) -> Self {
        Self {
            data: Cow::Borrowed(payload),
            original_len: payload.len(),
            stages: Vec::new(),
        }
    }

    fn push(&mut self, data: Vec<u8>, map: OffsetMap) {
        self.data = Cow::Owned(data);
        self.stages.push(map);
    }

    /// Whether any transform changed the payload
    pub fn is_transformed(&self) -> bool {
        !self.stages.is_empty()
    }

    pub fn original_len(&self) -> usize {
        self.original_len
    }

    /// Bytes added on top of the original payload
    pub fn inflation(&self) -> usize {
        self.data.len().saturating_sub(self.original_len)
    }

    /// How many original payload bytes are covered by `flushed` output bytes
    pub fn original_flushed(&self, flushed: usize) -> usize {
        self.stages
            .iter()
            .rev()
            .fold(flushed, |n, stage| stage.original(n))
            .min(self.original_len)
    }
}

/// Composed transform pipeline built from an `ObfuscationProfile`
///
/// Which transforms run depends on the stream classification:
/// - TLS: SNI masking then extension shuffle/padding, first write only
/// - HTTP: header case/whitespace then decoy headers, on writes that start a request
/// - Generic: entropy shaping then length-prefixed padding
#[derive(Debug, Clone, Default)]
pub struct Obfuscator {
    padding: Option<PaddingStrategy>,
    headers: Option<HeaderRandomizer>,
    decoys: Option<DecoyHeaders>,
    tls: Option<TlsExtensionShaper>,
    sni: Option<SniMasker>,
    entropy: Option<EntropyShaper>,
}

impl Obfuscator {
    pub fn new(
        profile: &ObfuscationProfile,
        whitelist: Arc<WhitelistSet>,
    ) -> Result<Self, ObfuscationError> {
        profile.validate()?;

        let padding = if profile.padding.enabled {
            Some(PaddingStrategy::new(&profile.padding)?)
        } else {
            None
        };

        if !profile.enabled {
            return Ok(Self {
                padding,
                ..Self::default()
            });
        }

        let http = &profile.http;
        let headers = HeaderRandomizer {
            randomize_case: http.randomize_case,
            randomize_method: http.randomize_method,
            extra_whitespace: http.extra_whitespace,
        };
        let decoys = http.decoy_headers.then(|| DecoyHeaders {
            min_count: http.decoy_min,
            max_count: http.decoy_max,
        });

        let tls = &profile.tls;
        let shaper = TlsExtensionShaper::new(
            tls.shuffle_extensions,
            tls.padding_extension
                .then_some((tls.padding_min, tls.padding_max)),
        )?;
        let sni = tls
            .mask_sni
            .then(|| SniMasker::new(whitelist, tls.sni_mode));

        let entropy = if profile.entropy.enabled {
            Some(EntropyShaper::new(&profile.entropy)?)
        } else {
            None
        };

        Ok(Self {
            padding,
            headers: (!headers.is_noop()).then_some(headers),
            decoys,
            tls: (!shaper.is_noop()).then_some(shaper),
            sni,
            entropy,
        })
    }

    /// Pipeline that never changes anything
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn is_passthrough(&self) -> bool {
        self.padding.is_none()
            && self.headers.is_none()
            && self.decoys.is_none()
            && self.tls.is_none()
            && self.sni.is_none()
            && self.entropy.is_none()
    }

    /// Whether the read side should strip length-prefixed padding
    pub fn pads(&self) -> bool {
        self.padding.is_some()
    }

    /// Run the transforms that apply to this payload
    ///
    /// `first_write` is true for the write that classified the stream.
    pub fn apply<'a>(
        &self,
        payload: &'a [u8],
        class: Classification,
        first_write: bool,
    ) -> Obfuscated<'a> {
        let mut out = Obfuscated::passthrough(payload);

        match class {
            Classification::TlsHandshake => {
                if !first_write || !is_tls_handshake(payload) {
                    return out;
                }
                if let Some(masked) = self.sni.as_ref().and_then(|m| m.apply(&out.data)) {
                    let map = opaque(&out.data, &masked);
                    out.push(masked, map);
                }
                if let Some(shaped) = self.tls.as_ref().and_then(|s| s.apply(&out.data)) {
                    let map = opaque(&out.data, &shaped);
                    out.push(shaped, map);
                }
            }
            Classification::HttpRequest => {
                if !is_http_request(payload) {
                    return out;
                }
                if let Some(headers) = &self.headers {
                    if let Some(rewritten) = headers.apply(&out.data) {
                        let map = if headers.preserves_length() {
                            OffsetMap::Identity
                        } else {
                            opaque(&out.data, &rewritten)
                        };
                        out.push(rewritten, map);
                    }
                }
                if let Some(with_decoys) = self.decoys.as_ref().and_then(|d| d.apply(&out.data)) {
                    let map = opaque(&out.data, &with_decoys);
                    out.push(with_decoys, map);
                }
            }
            Classification::Generic => {
                if let Some(shaper) = &self.entropy {
                    let shaped = shaper.shape(&out.data);
                    if shaped.inserted > 0 {
                        let map = OffsetMap::Interleaved {
                            block: shaper.block_size(),
                            pattern: shaped.pattern_len,
                            len: out.data.len(),
                        };
                        out.push(shaped.data, map);
                    }
                }
                if let Some(padding) = &self.padding {
                    let padded = padding.pad(&out.data);
                    let map = OffsetMap::Prefixed {
                        prefix: PADDING_HEADER_LEN,
                        len: out.data.len(),
                    };
                    out.push(padded, map);
                }
            }
        }

        if out.is_transformed() {
            trace!(
                "Obfuscated {} payload: {} -> {} bytes",
                class,
                out.original_len(),
                out.data.len()
            );
        }
        out
    }
}

fn opaque(input: &[u8], output: &[u8]) -> OffsetMap {
    OffsetMap::Opaque {
        len: input.len(),
        output_len: output.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_protocol::ClientHello;
    use shroud_protocol::testing::ClientHelloBuilder;

    fn whitelist() -> Arc<WhitelistSet> {
        Arc::new(WhitelistSet::from_domains(["mail.ru"]))
    }

    fn enabled_profile() -> ObfuscationProfile {
        ObfuscationProfile {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_is_passthrough() {
        let obfuscator = Obfuscator::new(&ObfuscationProfile::default(), whitelist()).unwrap();
        assert!(obfuscator.is_passthrough());

        let payload = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let out = obfuscator.apply(payload, Classification::HttpRequest, true);
        assert!(!out.is_transformed());
        assert!(matches!(out.data, Cow::Borrowed(_)));
        assert_eq!(out.original_flushed(7), 7);
    }

    #[test]
    fn test_generic_padding() {
        let mut profile = ObfuscationProfile::default();
        profile.padding.enabled = true;
        profile.padding.min_size = 10;
        profile.padding.max_size = 10;
        let obfuscator = Obfuscator::new(&profile, whitelist()).unwrap();
        assert!(obfuscator.pads());

        let out = obfuscator.apply(b"hello", Classification::Generic, true);
        assert_eq!(out.data.len(), 4 + 5 + 10);
        assert_eq!(out.inflation(), 14);
        assert_eq!(PaddingStrategy::unpad(&out.data).unwrap(), b"hello");

        assert_eq!(out.original_flushed(0), 0);
        assert_eq!(out.original_flushed(4), 0);
        assert_eq!(out.original_flushed(6), 2);
        assert_eq!(out.original_flushed(19), 5);
    }

    #[test]
    fn test_padding_skips_handshakes() {
        let mut profile = ObfuscationProfile::default();
        profile.padding.enabled = true;
        let obfuscator = Obfuscator::new(&profile, whitelist()).unwrap();

        let hello = ClientHelloBuilder::new().server_name("a.com").build();
        let out = obfuscator.apply(&hello, Classification::TlsHandshake, true);
        assert!(!out.is_transformed());

        let req = b"GET / HTTP/1.1\r\n\r\n";
        assert!(!obfuscator.apply(req, Classification::HttpRequest, true).is_transformed());
    }

    #[test]
    fn test_tls_first_write_only() {
        let mut profile = enabled_profile();
        profile.tls.mask_sni = true;
        let obfuscator = Obfuscator::new(&profile, whitelist()).unwrap();

        let hello = ClientHelloBuilder::new()
            .server_name("blocked.example")
            .extension(0x000a, &[0, 2, 0, 0x1d])
            .build();

        let out = obfuscator.apply(&hello, Classification::TlsHandshake, true);
        let parsed = ClientHello::parse(&out.data).unwrap();
        assert_eq!(parsed.server_name(), Some("mail.ru"));
        assert!(parsed.extension(shroud_protocol::EXT_PADDING).is_some());
        assert_eq!(out.original_flushed(out.data.len() - 1), 0);
        assert_eq!(out.original_flushed(out.data.len()), hello.len());

        let later = obfuscator.apply(&hello, Classification::TlsHandshake, false);
        assert!(!later.is_transformed());
    }

    #[test]
    fn test_http_case_only_is_identity() {
        let mut profile = enabled_profile();
        profile.http.decoy_headers = false;
        let obfuscator = Obfuscator::new(&profile, whitelist()).unwrap();

        let req = b"GET / HTTP/1.1\r\nHost: a.com\r\n\r\n";
        let out = obfuscator.apply(req, Classification::HttpRequest, true);

        assert_eq!(out.data.len(), req.len());
        assert_eq!(out.original_flushed(10), 10);

        // Body writes on an HTTP stream are left alone
        let body = obfuscator.apply(b"{\"k\":1}", Classification::HttpRequest, false);
        assert!(!body.is_transformed());
    }

    #[test]
    fn test_http_decoys() {
        let obfuscator = Obfuscator::new(&enabled_profile(), whitelist()).unwrap();

        let req = b"GET / HTTP/1.1\r\nHost: a.com\r\n\r\n";
        let out = obfuscator.apply(req, Classification::HttpRequest, true);

        assert!(out.data.len() > req.len());
        assert!(out.data.ends_with(b"\r\n\r\n"));
        assert_eq!(out.original_flushed(out.data.len()), req.len());
    }

    #[test]
    fn test_entropy_then_padding() {
        let mut profile = enabled_profile();
        profile.entropy.enabled = true;
        profile.padding.enabled = true;
        profile.padding.min_size = 0;
        profile.padding.max_size = 0;
        let obfuscator = Obfuscator::new(&profile, whitelist()).unwrap();

        let data: Vec<u8> = (0..3000).map(|_| fastrand::u8(..)).collect();
        let out = obfuscator.apply(&data, Classification::Generic, true);

        // 2 patterns of 16 bytes + 4-byte length prefix
        assert_eq!(out.data.len(), 3000 + 32 + 4);
        assert_eq!(out.original_flushed(4 + 1024), 1024);
        assert_eq!(out.original_flushed(4 + 1024 + 16), 1024);
        assert_eq!(out.original_flushed(4 + 1040 + 10), 1034);
        assert_eq!(out.original_flushed(out.data.len()), 3000);
    }

    #[test]
    fn test_invalid_profile() {
        let mut profile = enabled_profile();
        profile.http.decoy_min = 5;
        profile.http.decoy_max = 1;
        assert!(Obfuscator::new(&profile, whitelist()).is_err());
    }

    #[test]
    fn test_offset_maps() {
        let map = OffsetMap::Interleaved {
            block: 4,
            pattern: 2,
            len: 10,
        };
        assert_eq!(map.original(0), 0);
        assert_eq!(map.original(4), 4);
        assert_eq!(map.original(5), 4);
        assert_eq!(map.original(7), 5);
        assert_eq!(map.original(100), 10);
    }
}
