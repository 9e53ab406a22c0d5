//! Maps a URL to the `{category, domain_id}` pair a session is opened with.
//!
//! The `domain_info` registry is consulted first; unseen domains go through
//! the classifier chain and the result is cached write-once.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::classify::ClassifierChain;
use crate::error::Result;
use crate::store::TrackerStore;
use crate::types::{Classification, DomainInfo, ResolvedCategory};

static RE_HTTP_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)https?://(?:[^@/?#]*@)?([^/:?#\[\]]+)").unwrap());

/// Hostname of an `http`/`https` URL, lower-cased. Anything else (extension
/// pages, `file:`, `about:blank`) is not trackable.
pub fn extract_domain(url: &str) -> Option<String> {
    let captures = RE_HTTP_HOST.captures(url.trim())?;
    let host = captures.get(1)?.as_str().trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

pub struct CategoryResolver {
    store: Arc<dyn TrackerStore>,
    chain: ClassifierChain,
    ignored_domains: HashSet<String>,
}

impl CategoryResolver {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        chain: ClassifierChain,
        ignored_domains: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            chain,
            ignored_domains: ignored_domains
                .into_iter()
                .map(|domain| domain.to_ascii_lowercase())
                .collect(),
        }
    }

    /// `Ok(None)` means the page is not trackable and any open session
    /// should be stopped.
    pub fn resolve(&self, url: &str, now: DateTime<Utc>) -> Result<Option<ResolvedCategory>> {
        let Some(domain) = extract_domain(url) else {
            debug!(url, "URL is not trackable");
            return Ok(None);
        };
        if self.ignored_domains.contains(&domain) {
            debug!(domain = %domain, "Domain is ignored");
            return Ok(None);
        }
        self.resolve_domain(&domain, now).map(Some)
    }

    pub fn resolve_domain(&self, domain: &str, now: DateTime<Utc>) -> Result<ResolvedCategory> {
        if let Some(info) = self.store.domain_info_for_domain(domain)? {
            return Ok(ResolvedCategory::from(&info));
        }

        let info = DomainInfo::new(domain, self.chain.classify(domain), now);
        if self.store.insert_domain_info_if_absent(&info)? {
            return Ok(ResolvedCategory::from(&info));
        }

        // Lost a race with another writer; the first classification wins.
        match self.store.domain_info_for_domain(domain)? {
            Some(existing) => Ok(ResolvedCategory::from(&existing)),
            None => Ok(ResolvedCategory::from(&info)),
        }
    }

    /// Explicit re-registration. Replaces whatever was cached for `domain`.
    /// Open sessions keep the category they started with.
    pub fn register(
        &self,
        domain: &str,
        category: &str,
        subcategories: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<DomainInfo> {
        let info = DomainInfo::new(
            &domain.to_ascii_lowercase(),
            Classification {
                category: category.to_string(),
                subcategories,
                tags: Vec::new(),
            },
            now,
        );
        self.store.replace_domain_info(&info)?;
        debug!(domain_id = %info.domain_id, "Domain re-registered");
        Ok(info)
    }
}
