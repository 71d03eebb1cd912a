//! Tracing subscriber bootstrap shared by binaries and tests.

use std::io::IsTerminal;
use std::sync::Once;

use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "VOYAGE_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Install a stderr fmt subscriber filtered by `VOYAGE_LOG` (defaults to `info`).
///
/// Safe to call more than once; only the first call has an effect.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

        // Another subscriber may already be installed by the embedding application.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .try_init();
    });
}

/// Shorten a secret for log output.
pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    if prefix.len() < token.len() {
        format!("{prefix}…")
    } else {
        "***".to_owned()
    }
}
