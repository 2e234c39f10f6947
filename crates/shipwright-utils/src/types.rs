use serde::{Deserialize, Serialize};

/// Stage identifiers for the delivery pipeline.
///
/// `StageId` names the nine interchangeable pipeline units. Pipelines are
/// ordered subsets of these; [`StageId::ALL`] gives the canonical order used
/// for run reports.
///
/// # Serialization
///
/// `StageId` serializes to its lowercase string form (e.g. `"implement"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    /// Clarify phase: surfaces questions and records explicit assumptions.
    Clarify,
    /// Specify phase: turns the task description into a spec document.
    Specify,
    /// Decompose phase: splits a large task into a subtask DAG.
    Decompose,
    /// Design phase: produces design documents, optionally per subtask.
    Design,
    /// Implement phase: drives the agent to make the actual changes.
    Implement,
    /// Verify gate: dual test-pass/self-review check.
    Verify,
    /// Polish loop: bounded review-fix-test convergence over lenses.
    Polish,
    /// Integrate phase: merges subtask worktrees back into one.
    Integrate,
    /// Deliver phase: terminal summary and handoff.
    Deliver,
}

impl StageId {
    /// Canonical stage order covering every stage a run report mentions.
    pub const ALL: [Self; 9] = [
        Self::Clarify,
        Self::Specify,
        Self::Decompose,
        Self::Design,
        Self::Implement,
        Self::Verify,
        Self::Polish,
        Self::Integrate,
        Self::Deliver,
    ];

    /// Returns the canonical lowercase name of the stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clarify => "clarify",
            Self::Specify => "specify",
            Self::Decompose => "decompose",
            Self::Design => "design",
            Self::Implement => "implement",
            Self::Verify => "verify",
            Self::Polish => "polish",
            Self::Integrate => "integrate",
            Self::Deliver => "deliver",
        }
    }

    /// Parse a stage name as it appears in configuration files.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == name)
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External agent provider selecting the CLI binary and flag dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Claude Code CLI.
    #[default]
    Claude,
    /// Codex CLI.
    Codex,
}

impl Provider {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// Default executable name looked up on PATH when no binary is configured.
    #[must_use]
    pub const fn binary_name(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

/// Output modes supported by the agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputMode {
    /// Line-delimited JSON event stream (preferred).
    #[default]
    StreamJson,
    /// Plain text blob (fallback).
    Text,
}

impl OutputMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StreamJson => "stream-json",
            Self::Text => "text",
        }
    }
}

/// Cumulative token usage for one or more agent invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input (prompt) tokens consumed.
    pub input: u64,
    /// Output (completion) tokens produced.
    pub output: u64,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    /// Fold another usage record into this one.
    pub fn absorb(&mut self, other: Self) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
    }

    /// Combined input + output token count.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_round_trip() {
        for stage in StageId::ALL {
            assert_eq!(StageId::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(StageId::parse("ship-it"), None);
    }

    #[test]
    fn test_stage_id_serde_lowercase() {
        let json = serde_json::to_string(&StageId::Implement).unwrap();
        assert_eq!(json, "\"implement\"");
        let back: StageId = serde_json::from_str("\"verify\"").unwrap();
        assert_eq!(back, StageId::Verify);
    }

    #[test]
    fn test_provider_defaults() {
        assert_eq!(Provider::default(), Provider::Claude);
        assert_eq!(Provider::Codex.binary_name(), "codex");
    }

    #[test]
    fn test_output_mode_strings() {
        assert_eq!(OutputMode::StreamJson.as_str(), "stream-json");
        assert_eq!(OutputMode::Text.as_str(), "text");
    }

    #[test]
    fn test_token_usage_absorb_saturates() {
        let mut usage = TokenUsage::new(u64::MAX - 1, 10);
        usage.absorb(TokenUsage::new(5, 7));
        assert_eq!(usage.input, u64::MAX);
        assert_eq!(usage.output, 17);
        assert_eq!(usage.total(), u64::MAX);
    }
}
