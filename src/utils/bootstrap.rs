//! Bootstrap utilities for usermesh binaries.
//!
//! Shared initialization code for the service binaries.

use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with USERMESH_LOG environment variable.
///
/// Defaults to "info" level if USERMESH_LOG is not set. Set
/// USERMESH_LOG_FORMAT=json for one JSON object per line.
pub fn init_tracing() {
    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Identifier of this process instance: the host name when known.
pub fn instance_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

/// Value of `--config <path>` (or `--config=<path>`) on the command line.
pub fn config_path_arg() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(args: impl IntoIterator<Item = String>) -> Option<String> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Root span for a service; every log line inside carries `service` and `instance`.
pub fn service_span(service: &str) -> Span {
    tracing::info_span!("service", service = %service, instance = %instance_id())
}
