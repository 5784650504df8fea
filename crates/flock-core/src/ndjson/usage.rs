//! Token usage accounting.
//!
//! The worker reports usage on many event types and does not do so
//! consistently: some events carry per-call counts, others carry running
//! totals. Snapshots are therefore merged field by field with `max`, which
//! is correct for both styles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw `usage` object as it appears in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct UsageUpdate {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageUpdate {
    /// Read a usage object, tolerating missing or non-numeric fields.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let field = |name: &str| obj.get(name).and_then(Value::as_u64).unwrap_or(0);
        Some(Self {
            input_tokens: field("input_tokens"),
            output_tokens: field("output_tokens"),
            cache_creation_input_tokens: field("cache_creation_input_tokens"),
            cache_read_input_tokens: field("cache_read_input_tokens"),
        })
    }
}

/// Running context usage of one worker session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub max_context_tokens: u64,
    pub percent_used: f64,
}

impl ContextUsage {
    /// Empty snapshot for a context window of `max_context_tokens`.
    pub const fn new(max_context_tokens: u64) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
            max_context_tokens,
            percent_used: 0.0,
        }
    }

    /// Merge an update into the snapshot. Returns `true` if anything changed.
    pub fn merge(&mut self, update: &UsageUpdate) -> bool {
        let before = *self;
        self.input_tokens = self.input_tokens.max(update.input_tokens);
        self.output_tokens = self.output_tokens.max(update.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .max(update.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .max(update.cache_read_input_tokens);
        self.recompute();
        *self != before
    }

    fn recompute(&mut self) {
        self.total_tokens = self.input_tokens.saturating_add(self.output_tokens);
        self.percent_used = percent_used(self.total_tokens, self.max_context_tokens);
    }
}

/// `round(total / max * 1000) / 10`, i.e. a percentage with one decimal.
#[allow(clippy::cast_precision_loss)]
pub fn percent_used(total: u64, max: u64) -> f64 {
    if max == 0 {
        return 0.0;
    }
    (total as f64 / max as f64 * 1000.0).round() / 10.0
}
