//! Logging setup for hosts embedding the agent.

use probe_agent_types::env_utils::env_string;
use tracing_subscriber::EnvFilter;

/// Filter directives for the agent, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "PROBE_AGENT_LOG";

const DEFAULT_DIRECTIVES: &str = "info";

/// Build the filter: `PROBE_AGENT_LOG`, then `RUST_LOG`, then `info`.
/// Unparseable directives fall through to the next source.
pub fn env_filter() -> EnvFilter {
    env_string(LOG_ENV)
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install a stderr fmt subscriber. Returns `false` when a global subscriber
/// is already set, so repeated calls are harmless.
pub fn init_logging() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}
