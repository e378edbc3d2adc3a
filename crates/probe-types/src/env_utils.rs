//! Environment variable helpers for configuration overrides.
//!
//! Every `PROBE_AGENT_*` override in the workspace is read through these
//! helpers so unset and unparseable values behave the same way everywhere:
//! both fall back to the default.
//!
//! # Example
//!
//! ```
//! use probe_agent_types::env_utils::{env_bool, env_var_or};
//!
//! let version: u16 = env_var_or("PROBE_AGENT_RECORD_CLASS_VERSION", 55);
//! let verbose = env_bool("PROBE_AGENT_VERBOSE");
//! # let _ = (version, verbose);
//! ```

use std::str::FromStr;

/// Parse an environment variable, `None` when unset or unparseable.
pub fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse an environment variable, falling back to `default`.
pub fn env_var_or<T: FromStr>(key: &str, default: T) -> T {
    env_var(key).unwrap_or(default)
}

/// A non-empty string variable.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `true` for "1", "true", "yes" or "on" (any case).
pub fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_variables_use_defaults() {
        assert_eq!(env_var::<u16>("PROBE_AGENT_TEST_UNSET_VAR"), None);
        assert_eq!(env_var_or("PROBE_AGENT_TEST_UNSET_VAR", 7u16), 7);
        assert_eq!(env_string("PROBE_AGENT_TEST_UNSET_VAR"), None);
        assert!(!env_bool("PROBE_AGENT_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_set_variables_are_parsed() {
        std::env::set_var("PROBE_AGENT_TEST_NUMBER", " 52 ");
        std::env::set_var("PROBE_AGENT_TEST_FLAG", "Yes");
        assert_eq!(env_var::<u16>("PROBE_AGENT_TEST_NUMBER"), Some(52));
        assert!(env_bool("PROBE_AGENT_TEST_FLAG"));
        std::env::remove_var("PROBE_AGENT_TEST_NUMBER");
        std::env::remove_var("PROBE_AGENT_TEST_FLAG");
    }
}
