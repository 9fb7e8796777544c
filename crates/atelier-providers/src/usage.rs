//! Usage-record normalization and accumulation.
//!
//! Providers report token usage under two naming conventions
//! (`prompt_tokens`/`completion_tokens` and `input_tokens`/`output_tokens`),
//! with cache-read and reasoning counts nested in optional detail objects.
//! Normalization happens once at this boundary; everything downstream works
//! with the canonical [`RunUsage`] shape.

use atelier_types::RunUsage;
use serde_json::Value;

/// Normalizes one raw per-turn usage object into canonical counters.
///
/// A record with no usable usage data comes back all-zero. Non-finite numbers
/// count as zero for that field. A zero or absent total is derived as
/// input + output.
pub fn normalize_usage(record: &Value) -> RunUsage {
    let input_tokens = token_field(record, &["input_tokens", "prompt_tokens"]);
    let output_tokens = token_field(record, &["output_tokens", "completion_tokens"]);
    let mut total_tokens = token_field(record, &["total_tokens"]);
    if total_tokens == 0 {
        total_tokens = input_tokens.saturating_add(output_tokens);
    }

    let cached_input_tokens = detail_field(
        record,
        &["input_tokens_details", "prompt_tokens_details"],
        &["cached_tokens", "cache_read_tokens"],
    );
    let reasoning_output_tokens = detail_field(
        record,
        &["output_tokens_details", "completion_tokens_details"],
        &["reasoning_tokens"],
    );

    RunUsage {
        input_tokens,
        output_tokens,
        total_tokens,
        cached_input_tokens,
        reasoning_output_tokens,
    }
}

/// Sums a sequence of normalized records. Plain saturating addition, so the
/// result is associative and independent of record order.
pub fn accumulate(records: impl IntoIterator<Item = RunUsage>) -> RunUsage {
    records.into_iter().fold(RunUsage::default(), |acc, record| RunUsage {
        input_tokens: acc.input_tokens.saturating_add(record.input_tokens),
        output_tokens: acc.output_tokens.saturating_add(record.output_tokens),
        total_tokens: acc.total_tokens.saturating_add(record.total_tokens),
        cached_input_tokens: acc
            .cached_input_tokens
            .saturating_add(record.cached_input_tokens),
        reasoning_output_tokens: acc
            .reasoning_output_tokens
            .saturating_add(record.reasoning_output_tokens),
    })
}

/// Normalizes and sums raw usage objects in one pass.
pub fn accumulate_raw<'a>(records: impl IntoIterator<Item = &'a Value>) -> RunUsage {
    accumulate(records.into_iter().map(normalize_usage))
}

fn token_field(record: &Value, names: &[&str]) -> u64 {
    names
        .iter()
        .find_map(|name| record.get(name))
        .map(finite_count)
        .unwrap_or(0)
}

fn detail_field(record: &Value, containers: &[&str], names: &[&str]) -> u64 {
    containers
        .iter()
        .find_map(|container| record.get(container))
        .and_then(|details| names.iter().find_map(|name| details.get(name)))
        .map(finite_count)
        .unwrap_or(0)
}

fn finite_count(value: &Value) -> u64 {
    match value.as_f64() {
        Some(n) if n.is_finite() && n > 0.0 => n as u64,
        _ => 0,
    }
}
