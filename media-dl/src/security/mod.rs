//! URL safety checks applied at admission and on every redirect.

mod rate_limiter;
mod url_validator;

pub use rate_limiter::{HostRateLimitConfig, HostRateLimiter};
pub use url_validator::{UrlSafetyConfig, UrlSafetyPolicy, UrlValidator, UrlVerdict};
