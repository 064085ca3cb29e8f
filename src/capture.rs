//! Response capture: eligibility rules, persistence, lock release.

use axum::http::{HeaderMap, StatusCode, header};
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    decision::{PageCache, RenderTicket},
    entry::{self, CacheEntry, CachedRedirect},
    keys,
    variants::{self, EvaluatorInput},
};

const METRIC_CAPTURE_STORE_TOTAL: &str = "respiro_capture_store_total";
const METRIC_CAPTURE_SKIP_TOTAL: &str = "respiro_capture_skip_total";
const METRIC_GENERATION_SECONDS: &str = "respiro_generation_seconds";

/// What the capture step did with a rendered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Entry persisted; later requests can serve it.
    Stored(StoredEntry),
    /// Response was not cacheable. The lock was still released.
    Skipped(SkipReason),
}

/// Summary of a freshly stored entry, enough to decorate the outgoing
/// response without re-reading the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub entry_key: String,
    pub created_at: i64,
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The application vetoed caching for this response.
    Vetoed,
    /// Empty body with no redirect to replay.
    EmptyBody,
    /// 5xx responses are never cached.
    ServerError,
    /// Response set cookies and per-cookie variance is disabled.
    SetCookie,
    /// The store rejected the entry.
    StoreFailed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vetoed => "vetoed",
            Self::EmptyBody => "empty_body",
            Self::ServerError => "server_error",
            Self::SetCookie => "set_cookie",
            Self::StoreFailed => "store_failed",
        }
    }
}

impl PageCache {
    /// Record a rendered response under the ticket's page.
    ///
    /// Must be called exactly once per ticket. The regeneration lock is
    /// released on every path, stored or skipped, so an ineligible response
    /// never wedges the page until the lock TTL expires.
    pub async fn capture(
        &self,
        ticket: RenderTicket,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> CaptureOutcome {
        let outcome = self.try_capture(&ticket, status, headers, body).await;
        self.delete_quietly(&ticket.keys.lock_key()).await;

        match &outcome {
            CaptureOutcome::Stored(stored) => {
                counter!(METRIC_CAPTURE_STORE_TOTAL).increment(1);
                debug!(entry = %stored.entry_key, max_age = stored.max_age_secs, "captured page");
            }
            CaptureOutcome::Skipped(reason) => {
                counter!(METRIC_CAPTURE_SKIP_TOTAL, "reason" => reason.as_str()).increment(1);
                debug!(reason = reason.as_str(), "capture skipped");
            }
        }
        outcome
    }

    async fn try_capture(
        &self,
        ticket: &RenderTicket,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> CaptureOutcome {
        if ticket.veto.is_cancelled() {
            return CaptureOutcome::Skipped(SkipReason::Vetoed);
        }

        let redirect = self.captured_redirect(status, headers);
        let effectively_empty = body.iter().all(u8::is_ascii_whitespace);
        if effectively_empty && redirect.is_none() {
            return CaptureOutcome::Skipped(SkipReason::EmptyBody);
        }

        if status.is_server_error() {
            return CaptureOutcome::Skipped(SkipReason::ServerError);
        }

        // The full registry runs here, with the prior entry in hand; its
        // output defines the dimension set readers evaluate from now on.
        let input = EvaluatorInput {
            context: &ticket.context,
            prior_entry: ticket.prior_entry.as_ref(),
        };
        let record = self.variants().evaluate_all(&input);
        self.persist_dimension_ids(&ticket.keys.vary_key()).await;
        let entry_keys = keys::generate(&ticket.context, &record, ticket.force_refresh);

        let captured_headers = entry::capture_headers(headers, self.config());
        if !self.config().vary_on_response_cookies
            && captured_headers
                .get("set-cookie")
                .is_some_and(|values| !values.is_empty())
        {
            return CaptureOutcome::Skipped(SkipReason::SetCookie);
        }

        let max_age_secs =
            entry::max_age_override(&captured_headers).unwrap_or(self.config().max_age_secs);
        let now = OffsetDateTime::now_utc();
        let generation_secs = (now - ticket.started_at).as_seconds_f64().max(0.0);

        let entry = CacheEntry {
            body: body.to_vec(),
            created_at: ticket.started_at.unix_timestamp(),
            generation_secs,
            headers: captured_headers,
            status: status.as_u16(),
            status_line: status_line_for(status),
            redirect,
            max_age_secs,
            resource_version: ticket.resource_version,
        };

        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                self.note_store_error("encode", &error);
                return CaptureOutcome::Skipped(SkipReason::StoreFailed);
            }
        };
        if let Err(error) = self
            .store()
            .set(
                entry_keys.entry_key(),
                bytes,
                Some(self.config().entry_ttl(max_age_secs)),
            )
            .await
        {
            self.note_store_error("set", &error);
            return CaptureOutcome::Skipped(SkipReason::StoreFailed);
        }

        histogram!(METRIC_GENERATION_SECONDS).record(generation_secs);
        CaptureOutcome::Stored(StoredEntry {
            entry_key: entry_keys.entry_key().to_string(),
            created_at: entry.created_at,
            max_age_secs,
        })
    }

    fn captured_redirect(&self, status: StatusCode, headers: &HeaderMap) -> Option<CachedRedirect> {
        if !self.config().cache_redirects || !status.is_redirection() {
            return None;
        }
        let location = headers.get(header::LOCATION)?.to_str().ok()?;
        Some(CachedRedirect {
            status: status.as_u16(),
            location: location.to_string(),
        })
    }

    /// Refresh the persisted dimension-id set alongside the entry, so a
    /// racing reader evaluates with the set that produced it.
    async fn persist_dimension_ids(&self, vary_key: &str) {
        let ids = self.variants().ids();
        match variants::encode_dimension_ids(&ids) {
            Ok(bytes) => {
                if let Err(error) = self
                    .store()
                    .set(vary_key, bytes, Some(self.config().vary_ttl()))
                    .await
                {
                    self.note_store_error("set", &error);
                }
            }
            Err(error) => self.note_store_error("encode", &error),
        }
    }
}

fn status_line_for(status: StatusCode) -> Option<String> {
    if status == StatusCode::OK {
        return None;
    }
    let line = match status.canonical_reason() {
        Some(reason) => format!("HTTP/1.1 {} {reason}", status.as_u16()),
        None => format!("HTTP/1.1 {}", status.as_u16()),
    };
    Some(line)
}

// ============================================================================
// Tests
// ============================================================================
