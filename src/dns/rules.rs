//! Host classification: block, allow or redirect.
//!
//! Patterns are exact names ("example.com") or wildcards ("*.example.com",
//! matching any subdomain but not the base name). They are normalized once
//! at construction so lookups only lowercase the queried name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::RuleSettings;

/// Decision for one query name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Classification {
    Blocked,
    Allowed,
    /// Answer with this address instead of asking upstream.
    Redirected(String),
}

/// Anything that can classify a host name.
///
/// Lookups happen on the event loop for every query, so implementations
/// must answer synchronously and quickly. Unknown hosts are `Allowed`.
pub trait Classifier: Send + Sync {
    fn classify(&self, host: &str) -> Classification;
}

impl<C: Classifier + ?Sized> Classifier for Arc<C> {
    fn classify(&self, host: &str) -> Classification {
        (**self).classify(host)
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(&self, host: &str) -> Classification {
        (**self).classify(host)
    }
}

/// Classifier backed by a closure. See [`from_fn`].
pub struct FnClassifier<F>(F);

impl<F> Classifier for FnClassifier<F>
where
    F: Fn(&str) -> Classification + Send + Sync,
{
    fn classify(&self, host: &str) -> Classification {
        (self.0)(host)
    }
}

/// Wrap a closure as a [`Classifier`].
pub const fn from_fn<F>(f: F) -> FnClassifier<F>
where
    F: Fn(&str) -> Classification + Send + Sync,
{
    FnClassifier(f)
}

/// Lowercase a host name and drop its trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// A compiled set of host patterns.
#[derive(Debug, Clone, Default)]
pub struct HostPatterns {
    /// Exact names, lowercase, without trailing dot.
    exact: HashSet<String>,
    /// The part after "*" of each wildcard, e.g. ".ads.com".
    wildcard_suffixes: Vec<String>,
}

impl HostPatterns {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = HashSet::new();
        let mut wildcard_suffixes = Vec::new();

        for pattern in patterns {
            let pattern = normalize_host(pattern.as_ref());
            if let Some(suffix) = pattern.strip_prefix('*') {
                wildcard_suffixes.push(suffix.to_string());
            } else {
                exact.insert(pattern);
            }
        }

        Self {
            exact,
            wildcard_suffixes,
        }
    }

    /// Whether a normalized host matches any pattern.
    #[inline]
    pub fn matches(&self, host: &str) -> bool {
        self.exact.contains(host)
            || self
                .wildcard_suffixes
                .iter()
                .any(|suffix| host.ends_with(suffix.as_str()))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard_suffixes.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard_suffixes.len()
    }
}

/// In-memory rule set.
///
/// Precedence is redirected, then allowed, then blocked; a host matching
/// nothing is allowed.
#[derive(Debug, Clone, Default)]
pub struct HostRules {
    blocked: HostPatterns,
    allowed: HostPatterns,
    redirect_exact: HashMap<String, String>,
    redirect_wildcards: Vec<(String, String)>,
}

impl HostRules {
    pub fn new<B, A, R, S, T>(blocked: B, allowed: A, redirected: R) -> Self
    where
        B: IntoIterator<Item = S>,
        A: IntoIterator<Item = S>,
        R: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
        T: Into<String>,
    {
        let mut redirect_exact = HashMap::new();
        let mut redirect_wildcards = Vec::new();
        for (pattern, target) in redirected {
            let pattern = normalize_host(pattern.as_ref());
            let target = target.into().trim().to_string();
            if let Some(suffix) = pattern.strip_prefix('*') {
                redirect_wildcards.push((suffix.to_string(), target));
            } else {
                redirect_exact.insert(pattern, target);
            }
        }

        Self {
            blocked: HostPatterns::new(blocked),
            allowed: HostPatterns::new(allowed),
            redirect_exact,
            redirect_wildcards,
        }
    }

    /// Build the rule set described by the `[rules]` configuration table.
    pub fn from_settings(settings: &RuleSettings) -> Self {
        Self::new(
            &settings.blocked,
            &settings.allowed,
            settings
                .redirected
                .iter()
                .map(|(host, target)| (host, target.clone())),
        )
    }

    fn redirect_target(&self, host: &str) -> Option<&str> {
        if let Some(target) = self.redirect_exact.get(host) {
            return Some(target);
        }
        self.redirect_wildcards
            .iter()
            .find(|(suffix, _)| host.ends_with(suffix.as_str()))
            .map(|(_, target)| target.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
            && self.allowed.is_empty()
            && self.redirect_exact.is_empty()
            && self.redirect_wildcards.is_empty()
    }

    /// Total number of patterns across all three lists.
    pub fn len(&self) -> usize {
        self.blocked.len()
            + self.allowed.len()
            + self.redirect_exact.len()
            + self.redirect_wildcards.len()
    }
}

impl Classifier for HostRules {
    fn classify(&self, host: &str) -> Classification {
        let host = normalize_host(host);

        if let Some(target) = self.redirect_target(&host) {
            return Classification::Redirected(target.to_string());
        }
        if self.allowed.matches(&host) {
            return Classification::Allowed;
        }
        if self.blocked.matches(&host) {
            return Classification::Blocked;
        }
        Classification::Allowed
    }
}
