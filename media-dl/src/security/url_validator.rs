//! URL safety validation.
//!
//! Every URL a task is admitted with, and every redirect hop the transport
//! follows, goes through a [`UrlValidator`]. An unsafe verdict is a fatal,
//! non-retryable task error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use url::{Host, Url};

use super::rate_limiter::{HostRateLimitConfig, HostRateLimiter};
use crate::{Error, Result};

/// Outcome of validating a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlVerdict {
    Safe,
    Unsafe { reason: String },
}

impl UrlVerdict {
    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self::Unsafe {
            reason: reason.into(),
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Safe => None,
            Self::Unsafe { reason } => Some(reason),
        }
    }
}

/// Decides whether a URL may be fetched.
pub trait UrlValidator: Send + Sync {
    fn validate(&self, url: &str) -> UrlVerdict;
}

/// Configuration of [`UrlSafetyPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlSafetyConfig {
    /// Accepted URL schemes (lowercase).
    pub allowed_schemes: Vec<String>,
    /// Reject loopback, private, link-local and `localhost` targets.
    pub block_private_addresses: bool,
    /// When non-empty, only hosts matching one of these suffixes are allowed.
    pub allowed_domains: Vec<String>,
    /// Hosts matching one of these suffixes are rejected.
    pub denied_domains: Vec<String>,
    /// Regular expressions matched against the full URL.
    pub blocked_patterns: Vec<String>,
    /// Per-host admission rate limit; `None` disables limiting.
    pub rate_limit: Option<HostRateLimitConfig>,
}

impl Default for UrlSafetyConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            block_private_addresses: true,
            allowed_domains: Vec::new(),
            denied_domains: Vec::new(),
            blocked_patterns: Vec::new(),
            rate_limit: Some(HostRateLimitConfig::default()),
        }
    }
}

/// Default [`UrlValidator`].
#[derive(Debug)]
pub struct UrlSafetyPolicy {
    config: UrlSafetyConfig,
    patterns: Vec<Regex>,
    rate_limiter: Option<Arc<HostRateLimiter>>,
}

impl UrlSafetyPolicy {
    /// Build a policy, compiling the pattern blacklist.
    pub fn new(config: UrlSafetyConfig) -> Result<Self> {
        let patterns = config
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::config(format!("invalid blocked pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let rate_limiter = config
            .rate_limit
            .clone()
            .map(|c| Arc::new(HostRateLimiter::new(c)));

        Ok(Self {
            config,
            patterns,
            rate_limiter,
        })
    }

    /// The rate limiter, for wiring up the periodic sweeper.
    pub fn rate_limiter(&self) -> Option<&Arc<HostRateLimiter>> {
        self.rate_limiter.as_ref()
    }

    fn check_domain(&self, domain: &str) -> Option<String> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        if self.config.block_private_addresses
            && (domain == "localhost" || domain.ends_with(".localhost"))
        {
            return Some(format!("host '{}' is local", domain));
        }

        if self
            .config
            .denied_domains
            .iter()
            .any(|d| domain_matches(&domain, d))
        {
            return Some(format!("host '{}' is on the deny list", domain));
        }

        if !self.config.allowed_domains.is_empty()
            && !self
                .config
                .allowed_domains
                .iter()
                .any(|d| domain_matches(&domain, d))
        {
            return Some(format!("host '{}' is not on the allow list", domain));
        }

        None
    }
}

impl Default for UrlSafetyPolicy {
    fn default() -> Self {
        Self {
            config: UrlSafetyConfig::default(),
            patterns: Vec::new(),
            rate_limiter: Some(Arc::new(HostRateLimiter::default())),
        }
    }
}

impl UrlValidator for UrlSafetyPolicy {
    fn validate(&self, url: &str) -> UrlVerdict {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return UrlVerdict::unsafe_because(format!("invalid URL: {}", e)),
        };

        let scheme = parsed.scheme();
        if !self.config.allowed_schemes.iter().any(|s| s == scheme) {
            return UrlVerdict::unsafe_because(format!("scheme '{}' is not allowed", scheme));
        }

        let host_key = match parsed.host() {
            None => return UrlVerdict::unsafe_because("URL has no host"),
            Some(Host::Domain(domain)) => {
                if let Some(reason) = self.check_domain(domain) {
                    return UrlVerdict::unsafe_because(reason);
                }
                domain.to_ascii_lowercase()
            }
            Some(Host::Ipv4(ip)) => {
                if self.config.block_private_addresses && is_private_ip(IpAddr::V4(ip)) {
                    return UrlVerdict::unsafe_because(format!("address {} is not public", ip));
                }
                ip.to_string()
            }
            Some(Host::Ipv6(ip)) => {
                if self.config.block_private_addresses && is_private_ip(IpAddr::V6(ip)) {
                    return UrlVerdict::unsafe_because(format!("address {} is not public", ip));
                }
                ip.to_string()
            }
        };

        if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(url)) {
            return UrlVerdict::unsafe_because(format!(
                "URL matches blocked pattern '{}'",
                pattern.as_str()
            ));
        }

        if let Some(limiter) = &self.rate_limiter
            && !limiter.try_acquire(&host_key)
        {
            return UrlVerdict::unsafe_because(format!("rate limit exceeded for '{}'", host_key));
        }

        UrlVerdict::Safe
    }
}

/// Suffix match on label boundaries: `cdn.example.com` matches `example.com`.
fn domain_matches(domain: &str, pattern: &str) -> bool {
    let pattern = pattern.trim_start_matches("*.").trim_end_matches('.');
    if pattern.is_empty() {
        return false;
    }
    let pattern = pattern.to_ascii_lowercase();
    domain == pattern
        || domain
            .strip_suffix(pattern.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(config: UrlSafetyConfig) -> UrlSafetyPolicy {
        UrlSafetyPolicy::new(config).unwrap()
    }

    #[rstest]
    #[case("https://cdn.example.com/a.mp4", true)]
    #[case("http://93.184.216.34/a.mp4", true)]
    #[case("ftp://example.com/a.mp4", false)]
    #[case("file:///etc/passwd", false)]
    #[case("http://localhost:8080/a", false)]
    #[case("http://api.localhost/a", false)]
    #[case("http://127.0.0.1/a", false)]
    #[case("http://10.0.0.5/a", false)]
    #[case("http://192.168.1.1/a", false)]
    #[case("http://169.254.169.254/latest/meta-data", false)]
    #[case("http://[::1]/a", false)]
    #[case("http://[fd00::1]/a", false)]
    #[case("http://[::ffff:127.0.0.1]/a", false)]
    #[case("not a url", false)]
    fn test_default_policy(#[case] url: &str, #[case] safe: bool) {
        let policy = policy(UrlSafetyConfig::default());
        assert_eq!(policy.validate(url).is_safe(), safe, "{url}");
    }

    #[test]
    fn test_domain_lists() {
        let policy = policy(UrlSafetyConfig {
            allowed_domains: vec!["example.com".into()],
            denied_domains: vec!["ads.example.com".into()],
            ..Default::default()
        });
        assert!(policy.validate("https://example.com/a").is_safe());
        assert!(policy.validate("https://cdn.example.com/a").is_safe());
        assert!(!policy.validate("https://ads.example.com/a").is_safe());
        assert!(!policy.validate("https://badexample.com/a").is_safe());
        assert!(!policy.validate("https://other.org/a").is_safe());
    }

    #[test]
    fn test_blocked_patterns() {
        let policy = policy(UrlSafetyConfig {
            blocked_patterns: vec![r"\.exe(\?|$)".into()],
            ..Default::default()
        });
        let verdict = policy.validate("https://example.com/setup.exe");
        assert!(verdict.reason().unwrap().contains("blocked pattern"));
        assert!(policy.validate("https://example.com/a.mp4").is_safe());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = UrlSafetyPolicy::new(UrlSafetyConfig {
            blocked_patterns: vec!["(".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_rate_limit() {
        let policy = policy(UrlSafetyConfig {
            rate_limit: Some(HostRateLimitConfig {
                max_tokens: 1,
                refill_rate: 0.001,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(policy.validate("https://example.com/1").is_safe());
        let verdict = policy.validate("https://example.com/2");
        assert!(verdict.reason().unwrap().contains("rate limit"));
    }
}
