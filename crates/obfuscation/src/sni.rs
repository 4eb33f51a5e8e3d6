//! SNI masking against a whitelist

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shroud_protocol::{ClientHello, EXT_SERVER_NAME, server_name_extension};
use tracing::debug;

use crate::whitelist::WhitelistSet;

/// Zero-width code points interleaved into a hostname
const ZERO_WIDTH_CHARS: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// How a hostname is disguised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SniMaskMode {
    /// Replace the hostname with a whitelisted domain
    #[default]
    Fronting,
    /// Keep the hostname but interleave zero-width characters
    ZeroWidth,
}

/// Rewrites the server_name of a ClientHello
#[derive(Debug, Clone)]
pub struct SniMasker {
    whitelist: Arc<WhitelistSet>,
    mode: SniMaskMode,
}

impl SniMasker {
    pub fn new(whitelist: Arc<WhitelistSet>, mode: SniMaskMode) -> Self {
        Self { whitelist, mode }
    }

    pub fn mode(&self) -> SniMaskMode {
        self.mode
    }

    pub fn whitelist(&self) -> &Arc<WhitelistSet> {
        &self.whitelist
    }

    /// Hosts already on the whitelist are left alone
    pub fn should_mask(&self, host: &str) -> bool {
        !self.whitelist.contains(host)
    }

    /// Masked form of `host`, or `None` when it needs no masking
    pub fn masked_name(&self, host: &str) -> Option<String> {
        if !self.should_mask(host) {
            return None;
        }
        Some(match self.mode {
            SniMaskMode::Fronting => self.whitelist.select_for(host),
            SniMaskMode::ZeroWidth => insert_zero_width(host),
        })
    }

    /// Rewrite the SNI of a ClientHello record
    ///
    /// Returns `None` when the record does not parse, has no SNI, or the SNI is
    /// already whitelisted.
    pub fn apply(&self, record: &[u8]) -> Option<Vec<u8>> {
        let hello = ClientHello::parse(record).ok()?;
        let host = hello.server_name()?;
        let masked = self.masked_name(host)?;

        debug!(
            "Masking SNI ({:?}): {} bytes -> {} bytes",
            self.mode,
            host.len(),
            masked.len()
        );

        let mut replaced = false;
        let extensions: Vec<Vec<u8>> = hello
            .extensions()
            .iter()
            .map(|ext| {
                if ext.kind == EXT_SERVER_NAME && !replaced {
                    replaced = true;
                    server_name_extension(masked.as_bytes())
                } else {
                    hello.extension_bytes(ext).to_vec()
                }
            })
            .collect();

        hello.rebuild(extensions).ok()
    }
}

/// Insert a random zero-width character after each character (except the last)
/// with probability 1/3
pub fn insert_zero_width(host: &str) -> String {
    let count = host.chars().count();
    let mut out = String::with_capacity(host.len() * 2);

    for (i, ch) in host.chars().enumerate() {
        out.push(ch);
        if i + 1 < count && fastrand::u8(0..3) == 0 {
            out.push(ZERO_WIDTH_CHARS[fastrand::usize(0..ZERO_WIDTH_CHARS.len())]);
        }
    }
    out
}

/// Remove zero-width characters (what a cooperating peer does)
pub fn strip_zero_width(host: &str) -> String {
    host.chars().filter(|c| !ZERO_WIDTH_CHARS.contains(c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_protocol::testing::ClientHelloBuilder;

    fn hello(host: &str) -> Vec<u8> {
        ClientHelloBuilder::new()
            .server_name(host)
            .extension(0x000a, &[0x00, 0x02, 0x00, 0x1d])
            .build()
    }

    #[test]
    fn test_fronting_replaces_sni() {
        let whitelist = Arc::new(WhitelistSet::from_domains(["mail.ru"]));
        let masker = SniMasker::new(whitelist, SniMaskMode::Fronting);

        let out = masker.apply(&hello("blocked.example")).unwrap();
        let parsed = ClientHello::parse(&out).unwrap();

        assert_eq!(parsed.server_name(), Some("mail.ru"));
        assert_eq!(parsed.record_len(), out.len());
        assert!(parsed.extension(0x000a).is_some());
    }

    #[test]
    fn test_whitelisted_host_untouched() {
        let masker = SniMasker::new(Arc::new(WhitelistSet::with_defaults()), SniMaskMode::Fronting);

        assert!(!masker.should_mask("www.github.com"));
        assert!(masker.apply(&hello("www.github.com")).is_none());
    }

    #[test]
    fn test_zero_width_mode() {
        let masker = SniMasker::new(Arc::new(WhitelistSet::new()), SniMaskMode::ZeroWidth);

        let out = masker.apply(&hello("blocked.example.org")).unwrap();
        let parsed = ClientHello::parse(&out).unwrap();
        let name = parsed.server_name().unwrap();

        assert_eq!(strip_zero_width(name), "blocked.example.org");
        assert_eq!(parsed.record_len(), out.len());
    }

    #[test]
    fn test_insert_zero_width() {
        let host = "abcdefghijklmnopqrstuvwxyz.example";
        let mut inserted_any = false;

        for _ in 0..20 {
            let masked = insert_zero_width(host);
            assert_eq!(strip_zero_width(&masked), host);
            // Never appended after the last character
            assert!(masked.ends_with('e'));
            inserted_any |= masked.len() > host.len();
        }
        assert!(inserted_any);
    }

    #[test]
    fn test_no_sni() {
        let masker = SniMasker::new(Arc::new(WhitelistSet::new()), SniMaskMode::Fronting);
        let record = ClientHelloBuilder::new().extension(0x000a, &[0, 0]).build();
        assert!(masker.apply(&record).is_none());
    }
}
