//! Domains assumed to pass the censor unblocked
//!
//! The set is shared between SNI maskers (readers) and whatever control
//! surface edits it at runtime (writers), so it sits behind a reader/writer lock.

use parking_lot::RwLock;
use tracing::debug;

/// Returned when the set is empty
pub const FALLBACK_MASK_DOMAIN: &str = "yandex.ru";

/// Built-in seed list
pub const DEFAULT_WHITELIST: &[&str] = &[
    // Domestic services
    "mail.ru",
    "yandex.ru",
    "vk.com",
    "ok.ru",
    "sberbank.ru",
    "gosuslugi.ru",
    "mos.ru",
    "nalog.ru",
    "tinkoff.ru",
    "avito.ru",
    "wildberries.ru",
    "ozon.ru",
    "2gis.ru",
    "kinopoisk.ru",
    "ivi.ru",
    "megafon.ru",
    "mts.ru",
    "beeline.ru",
    "tele2.ru",
    "rt.ru",
    // Education
    "msu.ru",
    "spbu.ru",
    "hse.ru",
    "mipt.ru",
    "mephi.ru",
    "edu.ru",
    // International services with local presence
    "microsoft.com",
    "apple.com",
    "google.com",
    "cloudflare.com",
    "akamai.com",
    "amazon.com",
    "netflix.com",
    "spotify.com",
    // CDN and cloud
    "cloudflare.net",
    "akamaiedge.net",
    "amazonaws.com",
    "azureedge.net",
    "fastly.net",
    "stackpath.com",
    // Popular sites
    "wikipedia.org",
    "github.com",
    "stackoverflow.com",
    "reddit.com",
    "medium.com",
    "wordpress.com",
    "adobe.com",
    "oracle.com",
    "ibm.com",
    "intel.com",
    "nvidia.com",
    "amd.com",
    // Gaming
    "steampowered.com",
    "epicgames.com",
    "ea.com",
    "ubisoft.com",
    "blizzard.com",
    "riotgames.com",
    "minecraft.net",
    // Messaging
    "whatsapp.com",
    "telegram.org",
    "discord.com",
    "slack.com",
    "zoom.us",
    "skype.com",
];

/// Keyword hints mapping a requested domain's category to a masking domain
const CATEGORY_HINTS: &[(&[&str], &str)] = &[
    (&["cdn", "static"], "cloudflare.net"),
    (&["api"], "googleapis.com"),
    (&["video", "stream"], "youtube.com"),
    (&["chat", "messenger"], "telegram.org"),
];

/// Ordered, mutable, case-insensitive domain set
#[derive(Debug, Default)]
pub struct WhitelistSet {
    domains: RwLock<Vec<String>>,
}

impl WhitelistSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set seeded with the built-in list
    pub fn with_defaults() -> Self {
        Self::from_domains(DEFAULT_WHITELIST.iter().copied())
    }

    /// Set seeded from the given domains (lowercased, deduplicated, order kept)
    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = Self::new();
        for domain in domains {
            set.add(domain.as_ref());
        }
        set
    }

    /// Add a domain; returns false if it was already present or empty
    pub fn add(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        if domain.is_empty() {
            return false;
        }

        let mut domains = self.domains.write();
        if domains.iter().any(|d| *d == domain) {
            return false;
        }
        debug!("Whitelist add {}", domain);
        domains.push(domain);
        true
    }

    /// Remove a domain; returns false if it was not present
    pub fn remove(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        let mut domains = self.domains.write();
        let before = domains.len();
        domains.retain(|d| *d != domain);

        let removed = domains.len() != before;
        if removed {
            debug!("Whitelist remove {}", domain);
        }
        removed
    }

    /// Whether `domain` equals or is a subdomain of an entry
    pub fn contains(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        self.domains
            .read()
            .iter()
            .any(|wl| is_same_or_subdomain(&domain, wl))
    }

    /// Random entry, or the fallback domain when empty
    pub fn random(&self) -> String {
        let domains = self.domains.read();
        if domains.is_empty() {
            return FALLBACK_MASK_DOMAIN.to_string();
        }
        domains[fastrand::usize(0..domains.len())].clone()
    }

    /// Choose a masking domain for `domain`
    ///
    /// Preference order: an entry the domain belongs to (or that belongs to
    /// it), an entry with a substring relation, a category hint, a random entry.
    pub fn select_for(&self, domain: &str) -> String {
        let domain = normalize(domain);

        {
            let domains = self.domains.read();

            if let Some(wl) = domains
                .iter()
                .find(|wl| is_same_or_subdomain(&domain, wl) || is_same_or_subdomain(wl, &domain))
            {
                return wl.clone();
            }

            if !domain.is_empty() {
                if let Some(wl) = domains
                    .iter()
                    .find(|wl| domain.contains(wl.as_str()) || wl.contains(domain.as_str()))
                {
                    return wl.clone();
                }
            }
        }

        for (keywords, hint) in CATEGORY_HINTS {
            if keywords.iter().any(|k| domain.contains(k)) {
                return hint.to_string();
            }
        }

        self.random()
    }

    /// Snapshot of all entries in insertion order
    pub fn domains(&self) -> Vec<String> {
        self.domains.read().clone()
    }

    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn is_same_or_subdomain(domain: &str, parent: &str) -> bool {
    domain == parent
        || (domain.len() > parent.len()
            && domain.ends_with(parent)
            && domain.as_bytes()[domain.len() - parent.len() - 1] == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_contains_suffix_aware() {
        let set = WhitelistSet::from_domains(["vk.com"]);

        assert!(set.contains("vk.com"));
        assert!(set.contains("VK.COM"));
        assert!(set.contains("m.vk.com"));
        assert!(set.contains("static.m.Vk.com."));
        assert!(!set.contains("notvk.com"));
        assert!(!set.contains("vk.com.evil.org"));
        assert!(!set.contains("com"));
    }

    #[test]
    fn test_add_remove() {
        let set = WhitelistSet::new();

        assert!(set.add("Example.COM"));
        assert!(!set.add("example.com"));
        assert!(!set.add("  "));
        assert_eq!(set.domains(), vec!["example.com".to_string()]);

        assert!(set.remove("EXAMPLE.com"));
        assert!(!set.remove("example.com"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_defaults() {
        let set = WhitelistSet::with_defaults();
        assert_eq!(set.len(), DEFAULT_WHITELIST.len());
        assert!(set.contains("mail.yandex.ru"));
        assert!(set.contains("api.github.com"));
    }

    #[test]
    fn test_select_related() {
        let set = WhitelistSet::with_defaults();
        assert_eq!(set.select_for("cdn.github.com"), "github.com");
        assert_eq!(set.select_for("Maps.Google.com"), "google.com");
    }

    #[test]
    fn test_select_category_hints() {
        let set = WhitelistSet::from_domains(["mail.ru"]);

        assert_eq!(set.select_for("cdn.blocked.example"), "cloudflare.net");
        assert_eq!(set.select_for("api.blocked.example"), "googleapis.com");
        assert_eq!(set.select_for("video.blocked.example"), "youtube.com");
        assert_eq!(set.select_for("chat.blocked.example"), "telegram.org");
    }

    #[test]
    fn test_select_random_fallback() {
        let set = WhitelistSet::from_domains(["mail.ru", "ok.ru"]);
        for _ in 0..20 {
            let chosen = set.select_for("blocked.example");
            assert!(chosen == "mail.ru" || chosen == "ok.ru");
        }

        assert_eq!(WhitelistSet::new().select_for("x.example"), FALLBACK_MASK_DOMAIN);
    }

    #[test]
    fn test_concurrent_access() {
        let set = Arc::new(WhitelistSet::with_defaults());
        let mut handles = Vec::new();

        for i in 0..4 {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..100 {
                    set.add(&format!("host{}-{}.test", i, j));
                    let _ = set.select_for("blocked.example");
                    assert!(set.contains("github.com"));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.len(), DEFAULT_WHITELIST.len() + 400);
    }
}
