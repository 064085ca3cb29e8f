//! Canonical cache key construction.
//!
//! Every key is the hex digest of a canonical, order-fixed serialization of
//! its components, so semantically identical requests land on identical
//! keys no matter how their parts arrived. Coordination state hangs off the
//! two digests by suffix: `_reqs` off the entry key, `_genlock`, `_version`
//! and `_vary` off the page key.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::form_urlencoded;

use crate::{config::FORCE_REFRESH_PARAM, context::RequestContext, variants::VariantRecord};

/// Key bundle for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    page_key: String,
    entry_key: String,
}

impl Keys {
    /// Identity of the page ignoring variance. Anchors the regeneration
    /// lock, the version counter and the persisted dimension set, so every
    /// variant of a page shares them.
    pub fn page_key(&self) -> &str {
        &self.page_key
    }

    /// Identity of the page with variance folded in. Owns the entry blob
    /// and the visit counter.
    pub fn entry_key(&self) -> &str {
        &self.entry_key
    }

    pub(crate) fn request_count_key(&self) -> String {
        format!("{}_reqs", self.entry_key)
    }

    pub(crate) fn lock_key(&self) -> String {
        format!("{}_genlock", self.page_key)
    }

    pub(crate) fn version_key(&self) -> String {
        format!("{}_version", self.page_key)
    }

    pub(crate) fn vary_key(&self) -> String {
        format!("{}_vary", self.page_key)
    }
}

/// Generate the key bundle for a request.
///
/// `strip_refresh_param` removes the refresh parameter from the normalized
/// query; it is set only when the request presented the configured token,
/// so a bogus token yields an ordinary (distinct) page.
pub fn generate(ctx: &RequestContext, variants: &VariantRecord, strip_refresh_param: bool) -> Keys {
    let query = normalized_query(ctx.query(), strip_refresh_param);

    let mut page = ComponentHasher::new();
    page.text("host", ctx.host());
    page.text("path", ctx.path());
    page.query(&query);
    page.flag("ssl", ctx.is_https());

    let mut entry = ComponentHasher::new();
    entry.text("host", ctx.host());
    entry.text("method", ctx.method().as_str());
    entry.text("path", ctx.path());
    entry.query(&query);
    entry.flag("ssl", ctx.is_https());
    entry.map("uniqueness", ctx.uniqueness());
    entry.variants(variants);

    Keys {
        page_key: page.finish(),
        entry_key: entry.finish(),
    }
}

/// Query pairs decoded, optionally stripped of the refresh parameter, and
/// stably sorted by name. Repeated names keep their arrival order.
pub fn normalized_query(raw: &str, strip_refresh_param: bool) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(raw.as_bytes())
        .filter(|(name, _)| !(strip_refresh_param && name == FORCE_REFRESH_PARAM))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort_by(|left, right| left.0.cmp(&right.0));
    pairs
}

/// Whether the query carries the refresh parameter with the configured
/// token. The comparison is constant-time; the token is a shared secret.
pub(crate) fn force_refresh_requested(query: &str, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return false;
    };
    form_urlencoded::parse(query.as_bytes()).any(|(name, value)| {
        name == FORCE_REFRESH_PARAM && value.as_bytes().ct_eq(token.as_bytes()).unwrap_u8() == 1
    })
}

/// Canonical serialization fed to the digest.
///
/// Each segment is length-prefixed and each collection is count-prefixed,
/// so adjacent values can never collide across boundaries.
struct ComponentHasher {
    hasher: Sha256,
}

impl ComponentHasher {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn text(&mut self, label: &str, value: &str) {
        self.raw(label);
        self.raw(value);
    }

    fn flag(&mut self, label: &str, value: bool) {
        self.text(label, if value { "1" } else { "0" });
    }

    fn query(&mut self, pairs: &[(String, String)]) {
        self.raw("query");
        self.count(pairs.len());
        for (name, value) in pairs {
            self.raw(name);
            self.raw(value);
        }
    }

    fn map(&mut self, label: &str, entries: &BTreeMap<String, String>) {
        self.raw(label);
        self.count(entries.len());
        for (name, value) in entries {
            self.raw(name);
            self.raw(value);
        }
    }

    fn variants(&mut self, record: &VariantRecord) {
        self.raw("variants");
        self.count(record.len());
        for (id, value) in record {
            self.raw(id);
            match value {
                Some(value) => {
                    self.raw("+");
                    self.raw(value);
                }
                None => self.raw("-"),
            }
        }
    }

    fn count(&mut self, n: usize) {
        self.hasher.update((n as u64).to_be_bytes());
    }

    fn raw(&mut self, segment: &str) {
        self.hasher.update((segment.len() as u64).to_be_bytes());
        self.hasher.update(segment.as_bytes());
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

// ============================================================================
// Tests
// ============================================================================
