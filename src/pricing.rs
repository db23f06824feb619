// Pricing for token cost accounting
//
// Rates are USD per million tokens, sourced from each provider's public
// price list. Lookup is by case-insensitive substring so dated model ids
// ("gpt-4o-2024-08-06") hit their family row. First match wins, so more
// specific substrings come first.
// Last updated: 2026-07

/// Pricing information for a model family
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const FREE: ModelPricing = ModelPricing {
    input_per_million: 0.0,
    output_per_million: 0.0,
};

/// (substring, input $/MTok, output $/MTok)
const PRICING_TABLE: &[(&str, f64, f64)] = &[
    // Anthropic
    ("claude-opus", 15.00, 75.00),
    ("claude-sonnet", 3.00, 15.00),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-haiku", 1.00, 5.00),
    ("claude", 3.00, 15.00),
    // OpenAI
    ("gpt-5-mini", 0.25, 2.00),
    ("gpt-5-nano", 0.05, 0.40),
    ("gpt-5", 1.25, 10.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-3.5", 0.50, 1.50),
    ("o1-mini", 1.10, 4.40),
    ("o1", 15.00, 60.00),
    ("o3-mini", 1.10, 4.40),
    ("o3", 2.00, 8.00),
    ("o4-mini", 1.10, 4.40),
    ("codex", 1.25, 10.00),
    // Google
    ("gemini-2.5-pro", 1.25, 10.00),
    ("gemini-2.5-flash-lite", 0.10, 0.40),
    ("gemini-2.5-flash", 0.30, 2.50),
    ("gemini-3-pro", 2.00, 12.00),
    ("gemini-3-flash", 0.30, 2.50),
    ("gemini", 0.30, 2.50),
    // xAI
    ("grok-4.1-fast", 0.20, 0.50),
    ("grok-4-fast", 0.20, 0.50),
    ("grok-4", 3.00, 15.00),
    ("grok-3-mini", 0.30, 0.50),
    ("grok", 3.00, 15.00),
    // Moonshot
    ("kimi-k2.5", 0.60, 2.50),
    ("kimi", 0.60, 2.50),
    // Zhipu
    ("glm-4.7", 0.60, 2.20),
    ("glm", 0.60, 2.20),
    // MiniMax
    ("minimax", 0.30, 1.20),
    // DeepSeek
    ("deepseek", 0.28, 0.42),
    // Meta via routers
    ("llama", 0.20, 0.60),
    ("qwen", 0.25, 1.00),
];

/// Get pricing for a model id. Unknown cloud models fall back to Sonnet-class
/// rates so cost is over- rather than under-reported.
pub fn get_pricing(model: &str) -> ModelPricing {
    let lower = model.to_ascii_lowercase();
    for (needle, input, output) in PRICING_TABLE {
        if lower.contains(needle) {
            return ModelPricing {
                input_per_million: *input,
                output_per_million: *output,
            };
        }
    }
    ModelPricing {
        input_per_million: 3.00,
        output_per_million: 15.00,
    }
}

/// Pricing for local inference: always free
pub fn local_pricing() -> ModelPricing {
    FREE
}

/// Calculate cost in USD for the given token usage
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let pricing = get_pricing(model);
    (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
        + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match_hits_dated_ids() {
        let p = get_pricing("gpt-4o-2024-08-06");
        assert_eq!(p.input_per_million, 2.50);

        let p = get_pricing("claude-sonnet-4-20250514");
        assert_eq!(p.input_per_million, 3.00);
    }

    #[test]
    fn test_specific_before_general() {
        // gpt-4o-mini must not match the gpt-4o row
        assert_eq!(get_pricing("gpt-4o-mini").input_per_million, 0.15);
        assert_eq!(get_pricing("gemini-2.5-flash-lite").input_per_million, 0.10);
    }

    #[test]
    fn test_unknown_defaults_to_sonnet_class() {
        let p = get_pricing("mystery-model-9000");
        assert_eq!(p.input_per_million, 3.00);
        assert_eq!(p.output_per_million, 15.00);
    }

    #[test]
    fn test_calculate_cost() {
        // 1000 input + 500 output on sonnet rates = 0.003 + 0.0075
        let cost = calculate_cost("claude-sonnet-4", 1000, 500);
        assert!((cost - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn test_local_is_free() {
        let p = local_pricing();
        assert_eq!(p.input_per_million, 0.0);
        assert_eq!(p.output_per_million, 0.0);
    }
}
