// CLI module - command-line argument parsing
//
// The wider product wraps this proxy in an interactive selector, profile
// files and login flows; the core binary takes everything it needs as
// flags and environment variables.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, Env, RoleMap, VERSION};

/// Claudish - Anthropic Messages API proxy for any model provider
#[derive(Parser, Debug)]
#[command(name = "claudish")]
#[command(version = VERSION)]
#[command(about = "Run Anthropic-speaking agent CLIs against any model provider", long_about = None)]
pub struct Cli {
    /// Port to listen on (auto-picked from 52100-52199 when omitted)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Default target model, e.g. "oai@gpt-5" or "ollama/qwen3"
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Target for requests whose model contains "opus"
    #[arg(long)]
    pub opus: Option<String>,

    /// Target for requests whose model contains "sonnet"
    #[arg(long)]
    pub sonnet: Option<String>,

    /// Target for requests whose model contains "haiku"
    #[arg(long)]
    pub haiku: Option<String>,

    /// Target for subagent (haiku-class) requests when --haiku is unset
    #[arg(long)]
    pub subagent: Option<String>,

    /// Forward everything to Anthropic unchanged and just watch
    #[arg(long)]
    pub monitor: bool,

    /// Max concurrent local-inference requests (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    pub local_concurrency: usize,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> Config {
        Config {
            port: self.port,
            default_model: self.model,
            roles: RoleMap {
                opus: self.opus,
                sonnet: self.sonnet,
                haiku: self.haiku,
                subagent: self.subagent,
            },
            monitor: self.monitor,
            local_concurrency: self.local_concurrency,
            log_file: self.log_file,
            env: Env::capture(),
        }
    }
}
