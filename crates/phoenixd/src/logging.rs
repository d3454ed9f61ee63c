//! Logging setup shared by every role

use crate::process::Role;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber (`RUST_LOG`, default `info`)
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Span tagging every line with the process role, so the interleaved log of
/// the supervisor and its children stays attributable
pub fn role_span(role: &str) -> Span {
    tracing::info_span!("phoenixd", role, pid = std::process::id())
}

pub fn child_span(role: Role) -> Span {
    role_span(role.subcommand())
}
