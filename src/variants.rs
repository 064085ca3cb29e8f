//! Request-derived variance dimensions.
//!
//! A dimension splits one page into multiple cache slots keyed on request
//! context: device class, geo bucket, A/B arm. Dimensions are compiled
//! functions registered under unique names at construction time. The store
//! keeps the set of dimension ids that produced a page's entries under
//! `<pageKey>_vary`, so the read path evaluates exactly the set the write
//! path used, even across deploys that register new dimensions.

use std::{collections::BTreeMap, fmt};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{context::RequestContext, entry::CacheEntry, error::{ConfigError, StoreError}};

/// Evaluated dimension values, keyed by dimension id.
///
/// Every evaluated dimension occupies a slot; an absent value is recorded
/// as `None` rather than omitted, so "evaluated to nothing" and "never
/// evaluated" produce different keys.
pub type VariantRecord = BTreeMap<String, Option<String>>;

/// Name of the built-in dimension keyed on cached response cookies.
pub const RESPONSE_COOKIES_DIMENSION: &str = "response-cookies";

/// Inputs available to a dimension evaluator.
pub struct EvaluatorInput<'a> {
    /// The request being decided.
    pub context: &'a RequestContext,
    /// Entry previously cached for this page, when the capture path has
    /// one in hand. The read path always evaluates without it.
    pub prior_entry: Option<&'a CacheEntry>,
}

type BoxedEvaluator = Box<dyn Fn(&EvaluatorInput<'_>) -> Option<String> + Send + Sync>;

struct Dimension {
    id: String,
    name: String,
    evaluate: BoxedEvaluator,
}

/// Registry of variance dimensions, fixed once the cache is built.
#[derive(Default)]
pub struct VariantRegistry {
    dimensions: Vec<Dimension>,
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dimension under a unique name.
    ///
    /// Duplicate names are a configuration error; silently replacing an
    /// evaluator would change keys out from under live traffic.
    pub fn register<F>(&mut self, name: &str, evaluate: F) -> Result<(), ConfigError>
    where
        F: Fn(&EvaluatorInput<'_>) -> Option<String> + Send + Sync + 'static,
    {
        if self.dimensions.iter().any(|dimension| dimension.name == name) {
            return Err(ConfigError::duplicate_dimension(name));
        }
        self.dimensions.push(Dimension {
            id: dimension_id(name),
            name: name.to_string(),
            evaluate: Box::new(evaluate),
        });
        Ok(())
    }

    /// Register the built-in dimension that keys on the cookie set a cached
    /// response carried, one slot per distinct cookie signature.
    pub fn register_response_cookies(&mut self) -> Result<(), ConfigError> {
        self.register(RESPONSE_COOKIES_DIMENSION, |input| {
            let entry = input.prior_entry?;
            let values = entry.header_values("set-cookie");
            if values.is_empty() {
                return None;
            }
            let mut hasher = Sha256::new();
            for value in values {
                hasher.update(value.as_bytes());
                hasher.update([0u8]);
            }
            Some(hex::encode(&hasher.finalize()[..8]))
        })
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Sorted ids of every registered dimension.
    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .dimensions
            .iter()
            .map(|dimension| dimension.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Evaluate every registered dimension. Runs on the capture path, whose
    /// output defines the authoritative dimension set.
    pub(crate) fn evaluate_all(&self, input: &EvaluatorInput<'_>) -> VariantRecord {
        let mut record = VariantRecord::new();
        for dimension in &self.dimensions {
            record.insert(dimension.id.clone(), (dimension.evaluate)(input));
        }
        record
    }

    /// Evaluate a persisted dimension-id set.
    ///
    /// Ids with no registered evaluator stay in the record as absent, so
    /// keys remain stable until the next capture refreshes the set.
    pub(crate) fn evaluate_ids(&self, ids: &[String], input: &EvaluatorInput<'_>) -> VariantRecord {
        let mut record = VariantRecord::new();
        for id in ids {
            let value = match self.dimensions.iter().find(|dimension| dimension.id == *id) {
                Some(dimension) => (dimension.evaluate)(input),
                None => {
                    debug!(dimension = %id, "no evaluator registered for persisted dimension id");
                    None
                }
            };
            record.insert(id.clone(), value);
        }
        record
    }
}

impl fmt::Debug for VariantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .dimensions
            .iter()
            .map(|dimension| dimension.name.as_str())
            .collect();
        f.debug_struct("VariantRegistry")
            .field("dimensions", &names)
            .finish()
    }
}

/// Stable identity of a dimension, derived from its registered name.
pub(crate) fn dimension_id(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub(crate) fn encode_dimension_ids(ids: &[String]) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(ids).map_err(|error| StoreError::codec(error.to_string()))
}

pub(crate) fn decode_dimension_ids(bytes: &[u8]) -> Option<Vec<String>> {
    serde_json::from_slice(bytes).ok()
}

// ============================================================================
// Tests
// ============================================================================
