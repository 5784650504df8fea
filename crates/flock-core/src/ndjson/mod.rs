//! Stream-json (NDJSON) protocol support.
//!
//! Agent workers write one JSON object per line on stdout. This module
//! turns that stream into [`DomainMessage`]s and control events.

mod parser;
mod types;
mod usage;

pub use parser::{ParserEvent, StreamParser};
pub use types::*;
pub use usage::{ContextUsage, UsageUpdate, percent_used};
