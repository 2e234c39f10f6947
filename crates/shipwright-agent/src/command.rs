//! Argv-style command construction per provider.
//!
//! Arguments are passed as discrete elements only — no shell string
//! evaluation anywhere. The prompt itself travels on stdin, never in argv,
//! so it can be arbitrarily large and never hits the process table.

use std::path::{Path, PathBuf};

use shipwright_utils::types::{OutputMode, Provider};

use crate::types::AgentRequest;

/// A fully resolved invocation: binary plus argv.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

/// Resolve the provider binary, preferring an explicit configured path and
/// falling back to PATH lookup.
pub(crate) fn resolve_binary(
    provider: Provider,
    configured: Option<&Path>,
) -> Result<PathBuf, String> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    which::which(provider.binary_name()).map_err(|e| {
        format!(
            "{} CLI binary not found in PATH: {e}",
            provider.binary_name()
        )
    })
}

/// Build the invocation for a request.
pub(crate) fn build_invocation(
    request: &AgentRequest,
    configured: Option<&Path>,
) -> Result<Invocation, String> {
    let binary = resolve_binary(request.provider, configured)?;
    let args = match request.provider {
        Provider::Claude => build_claude_args(request),
        Provider::Codex => build_codex_args(request),
    };
    Ok(Invocation { binary, args })
}

fn build_claude_args(request: &AgentRequest) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        request.output_mode.as_str().to_string(),
    ];

    if request.output_mode == OutputMode::StreamJson {
        args.push("--verbose".to_string());
    }

    if !request.model.is_empty() {
        args.push("--model".to_string());
        args.push(request.model.clone());
    }

    if !request.tool_allow_list.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(request.tool_allow_list.join(","));
    }

    args.push("--dangerously-skip-permissions".to_string());
    args.push("--no-session-persistence".to_string());

    args
}

fn build_codex_args(request: &AgentRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];

    if request.output_mode == OutputMode::StreamJson {
        args.push("--json".to_string());
    }

    if !request.model.is_empty() {
        args.push("--model".to_string());
        args.push(request.model.clone());
    }

    args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
    args.push("--skip-git-repo-check".to_string());
    args.push("--color".to_string());
    args.push("never".to_string());
    // Read the prompt from stdin.
    args.push("-".to_string());

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentRequest;
    use shipwright_utils::types::{OutputMode, Provider};

    #[test]
    fn test_claude_stream_json_args() {
        let req = AgentRequest::new("p")
            .with_model("opus")
            .with_tool_allow_list(vec!["Read".to_string(), "Bash".to_string()]);
        let args = build_claude_args(&req);
        assert_eq!(args[0], "-p");
        assert!(args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read,Bash"]));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_claude_text_mode_skips_verbose() {
        let req = AgentRequest::new("p").with_output_mode(OutputMode::Text);
        let args = build_claude_args(&req);
        assert!(args.windows(2).any(|w| w == ["--output-format", "text"]));
        assert!(!args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_codex_args() {
        let req = AgentRequest::new("p")
            .with_provider(Provider::Codex)
            .with_model("gpt-5-codex");
        let args = build_codex_args(&req);
        assert_eq!(args[0], "exec");
        assert!(args.contains(&"--json".to_string()));
        assert!(args.windows(2).any(|w| w == ["--model", "gpt-5-codex"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_configured_binary_wins_over_path_lookup() {
        let path = PathBuf::from("/opt/agents/claude");
        let resolved = resolve_binary(Provider::Claude, Some(&path)).unwrap();
        assert_eq!(resolved, path);
    }
}
