//! Allow-listed environment for spawned agent processes.
//!
//! The child gets a locked-down environment: credentials for the agent
//! itself, locale, proxy settings, and a few vendor-prefixed families pass
//! through; everything else is stripped so host secrets cannot leak into
//! the agent process or its transcript.

/// Exact variable names passed through.
const ALLOWED_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "SHELL",
    "USER",
    "LOGNAME",
    "TMPDIR",
    "TERM",
    "COLORTERM",
    "NO_COLOR",
    "LANG",
    "TZ",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

/// Vendor and system prefixes passed through as whole families.
const ALLOWED_PREFIXES: &[&str] = &[
    "LC_",
    "XDG_",
    "ANTHROPIC_",
    "CLAUDE_",
    "OPENAI_",
    "CODEX_",
];

/// Whether one variable survives the filter.
#[must_use]
pub(crate) fn is_allowed(key: &str) -> bool {
    ALLOWED_KEYS.contains(&key) || ALLOWED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Filter an arbitrary environment down to the allow-list.
pub(crate) fn filter_env<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter().filter(|(k, _)| is_allowed(k)).collect()
}

/// The allow-listed view of this process's environment.
#[must_use]
pub(crate) fn allowlisted_env() -> Vec<(String, String)> {
    filter_env(std::env::vars())
}
