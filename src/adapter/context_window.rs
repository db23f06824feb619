// Context window hints keyed by model-name substring
//
// First match wins, so more specific substrings come first. These are
// compile-time hints; local transports override them with whatever the
// server actually reports, and CLAUDISH_CONTEXT_WINDOW overrides everything.

/// (substring, combined input+output token window)
const WINDOW_TABLE: &[(&str, u64)] = &[
    ("grok-4.1-fast", 2_000_000),
    ("grok-4-fast", 2_000_000),
    ("grok-4", 256_000),
    ("grok-3", 131_072),
    ("grok", 131_072),
    ("kimi-k2.5", 262_144),
    ("kimi", 131_072),
    ("gemini", 1_000_000),
    ("gpt-5", 256_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-3.5", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4", 200_000),
    ("codex", 256_000),
    ("glm-4.7", 200_000),
    ("glm", 128_000),
    ("minimax", 204_800),
    ("claude", 200_000),
    ("deepseek", 131_072),
    ("llama", 131_072),
    ("qwen", 131_072),
    ("mistral", 131_072),
];

/// Default window for unknown models
const DEFAULT_WINDOW: u64 = 128_000;

/// Look up the context window for a model id
pub fn lookup(model: &str) -> u64 {
    let lower = model.to_ascii_lowercase();
    for (needle, window) in WINDOW_TABLE {
        if lower.contains(needle) {
            return *window;
        }
    }
    DEFAULT_WINDOW
}
