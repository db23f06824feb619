//! Per-session token and cost tracking
//!
//! One tracker lives inside each composed handler. Stream translators report
//! usage as it arrives; the tracker folds it in under the handler's update
//! strategy, recomputes cost and context headroom, and snapshots the result
//! to `~/.claudish/tokens-<port>.json` so external tooling (status bars,
//! menu-bar companions) can watch a single well-known file.
//!
//! The snapshot is best-effort: write errors are logged at debug and never
//! surface into the request path.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;

use crate::config::Config;
use crate::pricing;

/// How usage reports are folded into the rolling counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStrategy {
    /// Assign input, accumulate output. The default for one-shot usage
    /// reports (OpenAI chat final usage chunk, Ollama done record).
    Standard,
    /// Accumulate both sides and recompute the full cost from the totals on
    /// every update. For upstreams that report usage repeatedly mid-stream.
    AccumulateBoth,
    /// Charge only context growth: with previous input P and new input N,
    /// the charged input is N-P when N >= P, else N (a drop below the fresh
    /// ratio means a new or concurrently-shared session).
    DeltaAware,
    /// Assign input, accumulate output, cost pinned to zero.
    Local,
    /// Prefer the upstream-reported dollar cost when it is positive
    /// (OpenRouter returns one); otherwise fall back to table rates.
    ActualCost,
}

/// Default ratio for the delta-aware fresh-session heuristic. Empirical;
/// override with CLAUDISH_DELTA_FRESH_RATIO.
const DEFAULT_FRESH_RATIO: f64 = 0.5;

#[derive(Debug, Default)]
struct TrackerState {
    input_tokens: u64,
    output_tokens: u64,
    total_cost: f64,
    previous_input: u64,
    context_window: u64,
}

pub struct TokenTracker {
    port: u16,
    provider_name: String,
    model_name: String,
    strategy: TokenStrategy,
    /// Token numbers came from our estimator, not upstream usage
    is_estimated: bool,
    fresh_ratio: f64,
    state: Mutex<TrackerState>,
}

impl TokenTracker {
    pub fn new(
        port: u16,
        provider_name: impl Into<String>,
        model_name: impl Into<String>,
        context_window: u64,
        strategy: TokenStrategy,
    ) -> Self {
        Self {
            port,
            provider_name: provider_name.into(),
            model_name: model_name.into(),
            strategy,
            is_estimated: false,
            fresh_ratio: DEFAULT_FRESH_RATIO,
            state: Mutex::new(TrackerState {
                context_window,
                ..Default::default()
            }),
        }
    }

    pub fn with_fresh_ratio(mut self, ratio: f64) -> Self {
        self.fresh_ratio = ratio;
        self
    }

    pub fn mark_estimated(&mut self) {
        self.is_estimated = true;
    }

    /// Replace the context window with a runtime-discovered value
    /// (local transports read it from the server; env override wins upstream)
    pub fn set_context_window(&self, window: u64) {
        let mut state = self.state.lock().unwrap();
        state.context_window = window;
        drop(state);
        self.write_status();
    }

    pub fn context_window(&self) -> u64 {
        self.state.lock().unwrap().context_window
    }

    /// Fold one usage report into the counters and snapshot the status file.
    ///
    /// `input` is the upstream-reported prompt size for this call; `output`
    /// is an output-token delta. `upstream_cost` is a dollar figure when the
    /// provider reports one.
    pub fn update(&self, input: u64, output: u64, upstream_cost: Option<f64>) {
        let mut state = self.state.lock().unwrap();

        match self.strategy {
            TokenStrategy::Standard => {
                state.input_tokens = input;
                state.output_tokens += output;
                state.total_cost += pricing::calculate_cost(&self.model_name, input, output);
            }
            TokenStrategy::AccumulateBoth => {
                state.input_tokens += input;
                state.output_tokens += output;
                state.total_cost = pricing::calculate_cost(
                    &self.model_name,
                    state.input_tokens,
                    state.output_tokens,
                );
            }
            TokenStrategy::DeltaAware => {
                let previous = state.previous_input;
                let charged = if input >= previous {
                    input - previous
                } else {
                    input
                };
                // A sharp drop means a different conversation is sharing this
                // session; start tracking it fresh
                if (input as f64) < self.fresh_ratio * previous as f64 {
                    tracing::debug!(
                        "input dropped {} -> {}, treating as fresh session",
                        previous,
                        input
                    );
                }
                state.previous_input = input;
                state.input_tokens = input;
                state.output_tokens += output;
                state.total_cost += pricing::calculate_cost(&self.model_name, charged, output);
            }
            TokenStrategy::Local => {
                state.input_tokens = input;
                state.output_tokens += output;
                state.total_cost = 0.0;
            }
            TokenStrategy::ActualCost => {
                state.input_tokens = input;
                state.output_tokens += output;
                match upstream_cost {
                    Some(cost) if cost > 0.0 => state.total_cost += cost,
                    _ => {
                        state.total_cost +=
                            pricing::calculate_cost(&self.model_name, input, output)
                    }
                }
            }
        }

        drop(state);
        self.write_status();
    }

    /// Context headroom as a percentage of the window
    pub fn context_left_percent(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.context_window == 0 {
            return 100.0;
        }
        let used = state.input_tokens + state.output_tokens;
        (100.0 - (used as f64 / state.context_window as f64) * 100.0).max(0.0)
    }

    pub fn snapshot(&self) -> (u64, u64, f64) {
        let state = self.state.lock().unwrap();
        (state.input_tokens, state.output_tokens, state.total_cost)
    }

    fn status_path(&self) -> PathBuf {
        Config::token_status_path(self.port)
    }

    fn write_status(&self) {
        let state = self.state.lock().unwrap();
        let used = state.input_tokens + state.output_tokens;
        let left = if state.context_window == 0 {
            100.0
        } else {
            (100.0 - (used as f64 / state.context_window as f64) * 100.0).max(0.0)
        };
        let snapshot = json!({
            "input_tokens": state.input_tokens,
            "output_tokens": state.output_tokens,
            "total_tokens": used,
            "total_cost": state.total_cost,
            "context_window": state.context_window,
            "context_left_percent": left,
            "provider_name": self.provider_name,
            "updated_at": Utc::now().to_rfc3339(),
            "is_free": self.strategy == TokenStrategy::Local || state.total_cost == 0.0,
            "is_estimated": self.is_estimated,
        });
        drop(state);

        if let Err(e) = crate::util::write_json_atomic(&self.status_path(), &snapshot) {
            tracing::debug!("token status write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(strategy: TokenStrategy) -> TokenTracker {
        TokenTracker::new(0, "test", "claude-sonnet-4", 200_000, strategy)
    }

    #[test]
    fn test_standard_assigns_input_accumulates_output() {
        let t = tracker(TokenStrategy::Standard);
        t.update(100, 10, None);
        t.update(150, 20, None);
        let (input, output, _) = t.snapshot();
        assert_eq!(input, 150);
        assert_eq!(output, 30);
    }

    #[test]
    fn test_accumulate_both_recomputes_cost_from_totals() {
        let t = tracker(TokenStrategy::AccumulateBoth);
        t.update(1000, 100, None);
        t.update(1000, 100, None);
        let (input, output, cost) = t.snapshot();
        assert_eq!(input, 2000);
        assert_eq!(output, 200);
        let expected = pricing::calculate_cost("claude-sonnet-4", 2000, 200);
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_delta_aware_charges_growth_only() {
        let t = tracker(TokenStrategy::DeltaAware);
        t.update(1000, 10, None);
        t.update(1500, 10, None);
        let (input, output, cost) = t.snapshot();
        assert_eq!(input, 1500);
        assert_eq!(output, 20);
        // Charged 1000 then 500 of input
        let expected = pricing::calculate_cost("claude-sonnet-4", 1000, 10)
            + pricing::calculate_cost("claude-sonnet-4", 500, 10);
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_delta_aware_fresh_session_charges_full() {
        let t = tracker(TokenStrategy::DeltaAware);
        t.update(10_000, 10, None);
        // Well below the 0.5x threshold: a fresh conversation
        t.update(400, 10, None);
        let (input, _, cost) = t.snapshot();
        assert_eq!(input, 400);
        let expected = pricing::calculate_cost("claude-sonnet-4", 10_000, 10)
            + pricing::calculate_cost("claude-sonnet-4", 400, 10);
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_local_cost_is_zero() {
        let t = tracker(TokenStrategy::Local);
        t.update(5000, 500, None);
        let (_, _, cost) = t.snapshot();
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn test_actual_cost_prefers_upstream() {
        let t = tracker(TokenStrategy::ActualCost);
        t.update(1000, 100, Some(0.042));
        let (_, _, cost) = t.snapshot();
        assert!((cost - 0.042).abs() < 1e-9);

        // Zero upstream cost falls back to the table
        let t = tracker(TokenStrategy::ActualCost);
        t.update(1000, 100, Some(0.0));
        let (_, _, cost) = t.snapshot();
        let expected = pricing::calculate_cost("claude-sonnet-4", 1000, 100);
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_context_left_percent() {
        let t = tracker(TokenStrategy::Standard);
        t.update(100_000, 0, None);
        assert!((t.context_left_percent() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_output_sum_matches_reported_deltas() {
        // The status-file invariant: total output equals the sum of deltas
        let t = tracker(TokenStrategy::Standard);
        let deltas = [5u64, 17, 3, 120];
        for d in deltas {
            t.update(1000, d, None);
        }
        let (_, output, _) = t.snapshot();
        assert_eq!(output, deltas.iter().sum::<u64>());
    }
}
