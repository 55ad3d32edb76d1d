//! Origin acceptance policy
//!
//! The upgrader consults a single `OriginPolicy` before accepting a
//! handshake. The default accepts every origin.

use std::collections::HashSet;

/// Decides whether a handshake's `Origin` header is acceptable
pub trait OriginPolicy: Send + Sync {
    /// `origin` is `None` when the request carries no `Origin` header
    fn allows(&self, origin: Option<&str>) -> bool;
}

/// Accepts every origin, including requests without one
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnyOrigin;

impl OriginPolicy for AllowAnyOrigin {
    fn allows(&self, _origin: Option<&str>) -> bool {
        true
    }
}

/// Accepts only the listed origins
///
/// Requests without an `Origin` header (non-browser clients) are accepted.
#[derive(Debug, Clone, Default)]
pub struct AllowedOrigins {
    origins: HashSet<String>,
}

impl AllowedOrigins {
    /// Create a policy from a list of origins
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origins: origins
                .into_iter()
                .map(|o| o.into().trim_end_matches('/').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl OriginPolicy for AllowedOrigins {
    fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            Some(origin) => self
                .origins
                .contains(&origin.trim_end_matches('/').to_ascii_lowercase()),
            None => true,
        }
    }
}

/// Build the policy described by a list of allowed origins
///
/// An empty list means any origin is accepted.
pub fn policy_from_list(origins: &[String]) -> Box<dyn OriginPolicy> {
    if origins.is_empty() {
        Box::new(AllowAnyOrigin)
    } else {
        Box::new(AllowedOrigins::new(origins.iter().cloned()))
    }
}
