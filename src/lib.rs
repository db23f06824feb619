// Claudish - Anthropic Messages API proxy for heterogeneous model providers
//
// An agent CLI configured to speak to Anthropic can address any model
// without modification: the proxy impersonates POST /v1/messages, re-routes
// each request to the selected upstream provider, and translates its stream
// back into Anthropic SSE in real time.
//
// Architecture:
// - model:     model-spec parsing and provider resolution (pure functions)
// - transport: per-provider endpoint/auth/queue/timeout bundles
// - adapter:   request translation per model family + streaming text fixup
// - stream:    upstream stream formats -> Anthropic SSE, with keepalives
// - vision:    image description fallback for text-only targets
// - tracker:   per-session token/cost accounting and the status file
// - handler:   one Transport + Adapter + translator + token strategy
// - router:    role resolution and the per-target handler cache
// - server:    the axum surface (messages, count_tokens, health)

pub mod adapter;
pub mod claude;
pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod model;
pub mod pricing;
pub mod router;
pub mod server;
pub mod stream;
pub mod tokens;
pub mod tracker;
pub mod transport;
pub mod util;
pub mod vision;
