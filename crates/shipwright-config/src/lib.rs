//! Configuration for shipwright pipelines.
//!
//! Configuration is resolved exactly once by merging three layers, lowest
//! precedence first: built-in defaults, an optional TOML file
//! (`SHIPWRIGHT_CONFIG` or `shipwright.toml` in the working directory), and
//! environment overrides (per key, and per stage for model names). The
//! resolved [`Config`] is immutable and memoized; nothing re-reads the
//! environment at runtime.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! provider = "claude"
//! log_dir = ".shipwright/logs"
//! tool_allow_list = ["Read", "Edit", "Write", "Bash"]
//!
//! [defaults]
//! model = "sonnet"
//! idle_timeout_secs = 300
//! hard_timeout_secs = 3600
//!
//! [stages.implement]
//! model = "opus"
//! hard_timeout_secs = 5400
//!
//! [pipelines]
//! trivial = ["implement", "verify", "deliver"]
//!
//! [polish]
//! lenses = ["code-quality", "design-consistency", "testing", "security"]
//! per_lens_cap = 5
//! global_cap = 15
//!
//! [converge]
//! light_model = "haiku"
//! heavy_model = "opus"
//! fanout_count = 3
//!
//! [budget]
//! token_budget = 0
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;

use shipwright_utils::error::ConfigError;
use shipwright_utils::types::{Provider, StageId};

mod pipeline_decl;

pub use pipeline_decl::{PipelineDeclaration, StageSpec};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Env var naming the configuration file.
const CONFIG_PATH_VAR: &str = "SHIPWRIGHT_CONFIG";
/// Default config file searched in the working directory.
const CONFIG_FILE_NAME: &str = "shipwright.toml";

/// Default model used when neither file nor environment names one.
const DEFAULT_MODEL: &str = "sonnet";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HARD_TIMEOUT_SECS: u64 = 3600;

/// Per-stage override entry from the `[stages.<name>]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageOverride {
    pub model: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub hard_timeout_secs: Option<u64>,
}

/// Default stage settings applied where no override exists.
#[derive(Debug, Clone)]
pub struct StageDefaults {
    pub model: String,
    pub idle_timeout_secs: u64,
    pub hard_timeout_secs: u64,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            hard_timeout_secs: DEFAULT_HARD_TIMEOUT_SECS,
        }
    }
}

/// Polish loop tuning: the ordered lens list and round caps.
#[derive(Debug, Clone)]
pub struct PolishConfig {
    /// Ordered review perspectives iterated by the polish stage.
    pub lenses: Vec<String>,
    /// Maximum review rounds per lens.
    pub per_lens_cap: u32,
    /// Maximum review rounds across all lenses.
    pub global_cap: u32,
    /// Consecutive zero-issue rounds required to declare a lens converged.
    pub converged_rounds: u32,
    /// Fraction of the token budget after which the loop aborts between
    /// rounds.
    pub budget_abort_fraction: f64,
}

impl Default for PolishConfig {
    fn default() -> Self {
        Self {
            lenses: vec![
                "code-quality".to_string(),
                "design-consistency".to_string(),
                "testing".to_string(),
                "security".to_string(),
            ],
            per_lens_cap: 5,
            global_cap: 15,
            converged_rounds: 2,
            budget_abort_fraction: 0.95,
        }
    }
}

/// Convergence tuning: model tiers and fan-out width.
#[derive(Debug, Clone)]
pub struct ConvergeConfig {
    /// Model used for light-complexity tasks and the classification call.
    pub light_model: String,
    /// Model used for heavy-complexity tasks.
    pub heavy_model: String,
    /// Instances spawned per fan-out (clamped to 10 by the runner).
    pub fanout_count: usize,
    /// Whether to run the optional second refine round.
    pub refine: bool,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            light_model: "haiku".to_string(),
            heavy_model: "opus".to_string(),
            fanout_count: 3,
            refine: false,
        }
    }
}

/// Fully resolved configuration.
///
/// Construct via [`Config::resolve`] (memoized, reads file + environment)
/// or [`Config::load_from`] for deterministic embedding/tests.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which agent CLI to drive by default.
    pub provider: Provider,
    /// Explicit path to the Claude CLI binary; PATH lookup when absent.
    pub claude_binary: Option<PathBuf>,
    /// Explicit path to the Codex CLI binary; PATH lookup when absent.
    pub codex_binary: Option<PathBuf>,
    /// Directory receiving per-task and per-stage agent transcripts.
    pub log_dir: Option<PathBuf>,
    /// Tools the agent may use, passed through as the CLI allow-list.
    pub tool_allow_list: Vec<String>,
    /// Global token budget across a task; 0 means unlimited.
    pub token_budget: u64,
    /// Settings applied where no per-stage override exists.
    pub defaults: StageDefaults,
    /// Per-stage overrides keyed by stage name.
    pub stages: HashMap<StageId, StageOverride>,
    /// The named pipelines, assembled once with their artifact contracts.
    pub pipelines: BTreeMap<String, PipelineDeclaration>,
    /// Polish loop tuning.
    pub polish: PolishConfig,
    /// Convergence tuning.
    pub converge: ConvergeConfig,
    /// Bounded retries for specify/design gap reports.
    pub gap_retry_limit: u32,
    /// Number of candidate designs fanned out by the design stage; >1
    /// routes design generation through the convergence runner.
    pub design_candidates: usize,
}

impl Config {
    /// Resolve the effective configuration once and memoize it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configured file cannot be read or
    /// parsed, or an override value is invalid. Once a resolution has
    /// succeeded, subsequent calls are infallible.
    pub fn resolve() -> Result<&'static Self, ConfigError> {
        if let Some(cfg) = CONFIG.get() {
            return Ok(cfg);
        }
        let env: HashMap<String, String> = std::env::vars().collect();
        let path = env
            .get(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(CONFIG_FILE_NAME);
                default.exists().then_some(default)
            });
        let cfg = Self::load_from(path.as_deref(), &env)?;
        Ok(CONFIG.get_or_init(|| cfg))
    }

    /// Load a configuration from an explicit file and environment map.
    ///
    /// This is the deterministic entry point used by tests and embedders;
    /// [`Config::resolve`] delegates here.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on unreadable/unparsable files, unknown
    /// stage names in pipeline lists, or malformed override values.
    pub fn load_from(
        path: Option<&std::path::Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| ConfigError::FileRead {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })?;
                toml::from_str::<ConfigFile>(&text).map_err(|e| ConfigError::FileParse {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            None => ConfigFile::default(),
        };

        let mut cfg = Self::from_file(file)?;
        cfg.apply_env_overrides(env)?;
        Ok(cfg)
    }

    /// A minimal configuration with built-in defaults only. Intended for
    /// tests that need deterministic behavior independent of the host.
    #[must_use]
    pub fn minimal_for_testing() -> Self {
        let mut cfg = Self::from_file(ConfigFile::default())
            .unwrap_or_else(|e| panic!("built-in defaults must resolve: {e}"));
        cfg.defaults.idle_timeout_secs = 5;
        cfg.defaults.hard_timeout_secs = 30;
        cfg.reassemble_pipelines();
        cfg
    }

    /// Rebuild every pipeline declaration against the current stage
    /// settings. Needed whenever timeouts change after assembly.
    fn reassemble_pipelines(&mut self) {
        let labels: Vec<(String, Vec<StageId>)> = self
            .pipelines
            .iter()
            .map(|(label, decl)| (label.clone(), decl.stages.iter().map(|s| s.id).collect()))
            .collect();
        for (label, ids) in labels {
            let decl = PipelineDeclaration::assemble(&label, &ids, self);
            self.pipelines.insert(label, decl);
        }
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let agent = file.agent.unwrap_or_default();
        let defaults_file = file.defaults.unwrap_or_default();
        let defaults = StageDefaults {
            model: defaults_file.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            idle_timeout_secs: defaults_file
                .idle_timeout_secs
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            hard_timeout_secs: defaults_file
                .hard_timeout_secs
                .unwrap_or(DEFAULT_HARD_TIMEOUT_SECS),
        };

        let mut stages: HashMap<StageId, StageOverride> = HashMap::new();
        for (name, entry) in file.stages.unwrap_or_default() {
            let id = StageId::parse(&name).ok_or_else(|| ConfigError::UnknownStage {
                name: name.clone(),
                pipeline: "[stages]".to_string(),
            })?;
            stages.insert(id, entry);
        }

        let polish_file = file.polish.unwrap_or_default();
        let polish_defaults = PolishConfig::default();
        let polish = PolishConfig {
            lenses: polish_file.lenses.unwrap_or(polish_defaults.lenses),
            per_lens_cap: polish_file.per_lens_cap.unwrap_or(polish_defaults.per_lens_cap),
            global_cap: polish_file.global_cap.unwrap_or(polish_defaults.global_cap),
            converged_rounds: polish_file
                .converged_rounds
                .unwrap_or(polish_defaults.converged_rounds),
            budget_abort_fraction: polish_file
                .budget_abort_fraction
                .unwrap_or(polish_defaults.budget_abort_fraction),
        };
        if !(0.0..=1.0).contains(&polish.budget_abort_fraction) {
            return Err(ConfigError::InvalidValue {
                key: "polish.budget_abort_fraction".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }

        let converge_file = file.converge.unwrap_or_default();
        let converge_defaults = ConvergeConfig::default();
        let converge = ConvergeConfig {
            light_model: converge_file
                .light_model
                .unwrap_or(converge_defaults.light_model),
            heavy_model: converge_file
                .heavy_model
                .unwrap_or(converge_defaults.heavy_model),
            fanout_count: converge_file
                .fanout_count
                .unwrap_or(converge_defaults.fanout_count),
            refine: converge_file.refine.unwrap_or(converge_defaults.refine),
        };

        let mut cfg = Self {
            provider: agent.provider.unwrap_or_default(),
            claude_binary: agent.claude_binary.map(PathBuf::from),
            codex_binary: agent.codex_binary.map(PathBuf::from),
            log_dir: agent.log_dir.map(PathBuf::from),
            tool_allow_list: agent.tool_allow_list.unwrap_or_else(default_tool_allow_list),
            token_budget: file.budget.unwrap_or_default().token_budget.unwrap_or(0),
            defaults,
            stages,
            pipelines: BTreeMap::new(),
            polish,
            converge,
            gap_retry_limit: file.gap_retry_limit.unwrap_or(2),
            design_candidates: file.design_candidates.unwrap_or(1),
        };

        let mut pipeline_names: BTreeMap<String, Vec<String>> = default_pipeline_names();
        if let Some(overrides) = file.pipelines {
            for (label, list) in overrides {
                pipeline_names.insert(label, list);
            }
        }
        for (label, names) in pipeline_names {
            let mut ids = Vec::with_capacity(names.len());
            for name in &names {
                let id = StageId::parse(name).ok_or_else(|| ConfigError::UnknownStage {
                    name: name.clone(),
                    pipeline: label.clone(),
                })?;
                ids.push(id);
            }
            let decl = PipelineDeclaration::assemble(&label, &ids, &cfg);
            cfg.pipelines.insert(label, decl);
        }

        Ok(cfg)
    }

    /// Apply environment overrides, per key and per stage for models.
    fn apply_env_overrides(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(provider) = env.get("SHIPWRIGHT_PROVIDER") {
            self.provider = match provider.as_str() {
                "claude" => Provider::Claude,
                "codex" => Provider::Codex,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "SHIPWRIGHT_PROVIDER".to_string(),
                        reason: format!("unknown provider '{other}'"),
                    });
                }
            };
        }

        if let Some(model) = env.get("SHIPWRIGHT_MODEL") {
            self.defaults.model = model.clone();
        }
        for stage in StageId::ALL {
            let key = format!("SHIPWRIGHT_MODEL_{}", stage.as_str().to_uppercase());
            if let Some(model) = env.get(&key) {
                self.stages.entry(stage).or_default().model = Some(model.clone());
            }
        }
        if let Some(model) = env.get("SHIPWRIGHT_MODEL_CONVERGE_LIGHT") {
            self.converge.light_model = model.clone();
        }
        if let Some(model) = env.get("SHIPWRIGHT_MODEL_CONVERGE_HEAVY") {
            self.converge.heavy_model = model.clone();
        }

        if let Some(budget) = env.get("SHIPWRIGHT_TOKEN_BUDGET") {
            self.token_budget = budget.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SHIPWRIGHT_TOKEN_BUDGET".to_string(),
                reason: format!("'{budget}' is not a non-negative integer"),
            })?;
        }
        if let Some(dir) = env.get("SHIPWRIGHT_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }

        // Timeout overrides touch the assembled pipeline declarations too,
        // so reassemble after applying them.
        let mut timeouts_changed = false;
        if let Some(secs) = env.get("SHIPWRIGHT_IDLE_TIMEOUT_SECS") {
            self.defaults.idle_timeout_secs =
                parse_secs("SHIPWRIGHT_IDLE_TIMEOUT_SECS", secs)?;
            timeouts_changed = true;
        }
        if let Some(secs) = env.get("SHIPWRIGHT_HARD_TIMEOUT_SECS") {
            self.defaults.hard_timeout_secs =
                parse_secs("SHIPWRIGHT_HARD_TIMEOUT_SECS", secs)?;
            timeouts_changed = true;
        }
        if timeouts_changed {
            self.reassemble_pipelines();
        }

        Ok(())
    }

    /// Model for a stage, with precedence: per-stage override > defaults.
    #[must_use]
    pub fn model_for_stage(&self, stage: StageId) -> &str {
        self.stages
            .get(&stage)
            .and_then(|s| s.model.as_deref())
            .unwrap_or(&self.defaults.model)
    }

    /// Idle/hard timeout pair for a stage.
    #[must_use]
    pub fn timeouts_for_stage(&self, stage: StageId) -> (Duration, Duration) {
        let entry = self.stages.get(&stage);
        let idle = entry
            .and_then(|s| s.idle_timeout_secs)
            .unwrap_or(self.defaults.idle_timeout_secs);
        let hard = entry
            .and_then(|s| s.hard_timeout_secs)
            .unwrap_or(self.defaults.hard_timeout_secs);
        (Duration::from_secs(idle), Duration::from_secs(hard))
    }

    /// The pipeline declaration for a task size/complexity label.
    #[must_use]
    pub fn pipeline_for_label(&self, label: &str) -> Option<&PipelineDeclaration> {
        self.pipelines.get(label)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{value}' is not a number of seconds"),
    })
}

fn default_tool_allow_list() -> Vec<String> {
    ["Read", "Edit", "Write", "Bash", "Grep", "Glob"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// The four built-in pipelines keyed by task size/complexity label.
fn default_pipeline_names() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert(
        "trivial".to_string(),
        vec!["implement", "verify", "deliver"]
            .into_iter()
            .map(str::to_string)
            .collect(),
    );
    map.insert(
        "small".to_string(),
        vec!["clarify", "implement", "verify", "deliver"]
            .into_iter()
            .map(str::to_string)
            .collect(),
    );
    map.insert(
        "medium".to_string(),
        vec![
            "clarify",
            "specify",
            "design",
            "implement",
            "verify",
            "polish",
            "deliver",
        ]
        .into_iter()
        .map(str::to_string)
        .collect(),
    );
    map.insert(
        "large".to_string(),
        vec![
            "clarify",
            "specify",
            "decompose",
            "design",
            "implement",
            "verify",
            "polish",
            "integrate",
            "deliver",
        ]
        .into_iter()
        .map(str::to_string)
        .collect(),
    );
    map
}

// ---------------------------------------------------------------------------
// File-layer structs (everything optional; merged over defaults)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    agent: Option<AgentFile>,
    defaults: Option<DefaultsFile>,
    stages: Option<HashMap<String, StageOverride>>,
    pipelines: Option<HashMap<String, Vec<String>>>,
    polish: Option<PolishFile>,
    converge: Option<ConvergeFile>,
    budget: Option<BudgetFile>,
    gap_retry_limit: Option<u32>,
    design_candidates: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AgentFile {
    provider: Option<Provider>,
    claude_binary: Option<String>,
    codex_binary: Option<String>,
    log_dir: Option<String>,
    tool_allow_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DefaultsFile {
    model: Option<String>,
    idle_timeout_secs: Option<u64>,
    hard_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PolishFile {
    lenses: Option<Vec<String>>,
    per_lens_cap: Option<u32>,
    global_cap: Option<u32>,
    converged_rounds: Option<u32>,
    budget_abort_fraction: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConvergeFile {
    light_model: Option<String>,
    heavy_model: Option<String>,
    fanout_count: Option<usize>,
    refine: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BudgetFile {
    token_budget: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let cfg = Config::load_from(None, &HashMap::new()).unwrap();
        assert_eq!(cfg.provider, Provider::Claude);
        assert_eq!(cfg.defaults.model, "sonnet");
        assert_eq!(cfg.token_budget, 0);
        assert_eq!(cfg.pipelines.len(), 4);
        assert_eq!(cfg.polish.per_lens_cap, 5);
        assert_eq!(cfg.polish.global_cap, 15);
    }

    #[test]
    fn test_trivial_pipeline_stage_list() {
        let cfg = Config::load_from(None, &HashMap::new()).unwrap();
        let trivial = cfg.pipeline_for_label("trivial").unwrap();
        let ids: Vec<StageId> = trivial.stages.iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![StageId::Implement, StageId::Verify, StageId::Deliver]
        );
    }

    #[test]
    fn test_requires_derived_from_upstream_produces() {
        let cfg = Config::load_from(None, &HashMap::new()).unwrap();

        // In the trivial pipeline nothing produces spec.md/design.md, so
        // implement must not require them.
        let trivial = cfg.pipeline_for_label("trivial").unwrap();
        let implement = trivial.stage(StageId::Implement).unwrap();
        assert!(implement.requires.is_empty());

        // In medium, specify and design run first, so both are required.
        let medium = cfg.pipeline_for_label("medium").unwrap();
        let implement = medium.stage(StageId::Implement).unwrap();
        assert!(implement.requires.contains(&"spec.md".to_string()));
        assert!(implement.requires.contains(&"design.md".to_string()));
    }

    #[test]
    fn test_file_overrides_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipwright.toml");
        std::fs::write(
            &path,
            r#"
[defaults]
model = "opus"

[stages.implement]
hard_timeout_secs = 5400

[budget]
token_budget = 2000000
"#,
        )
        .unwrap();

        let cfg = Config::load_from(Some(&path), &HashMap::new()).unwrap();
        assert_eq!(cfg.defaults.model, "opus");
        assert_eq!(cfg.token_budget, 2_000_000);
        let (_, hard) = cfg.timeouts_for_stage(StageId::Implement);
        assert_eq!(hard, Duration::from_secs(5400));
        // Untouched stage falls back to defaults.
        let (_, hard) = cfg.timeouts_for_stage(StageId::Verify);
        assert_eq!(hard, Duration::from_secs(3600));
    }

    #[test]
    fn test_env_overrides_beat_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipwright.toml");
        std::fs::write(&path, "[defaults]\nmodel = \"opus\"\n").unwrap();

        let cfg = Config::load_from(
            Some(&path),
            &env(&[
                ("SHIPWRIGHT_MODEL", "sonnet"),
                ("SHIPWRIGHT_MODEL_IMPLEMENT", "opus"),
                ("SHIPWRIGHT_TOKEN_BUDGET", "500000"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.defaults.model, "sonnet");
        assert_eq!(cfg.model_for_stage(StageId::Implement), "opus");
        assert_eq!(cfg.model_for_stage(StageId::Verify), "sonnet");
        assert_eq!(cfg.token_budget, 500_000);
    }

    #[test]
    fn test_converge_model_env_overrides() {
        let cfg = Config::load_from(
            None,
            &env(&[
                ("SHIPWRIGHT_MODEL_CONVERGE_LIGHT", "haiku-next"),
                ("SHIPWRIGHT_MODEL_CONVERGE_HEAVY", "opus-next"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.converge.light_model, "haiku-next");
        assert_eq!(cfg.converge.heavy_model, "opus-next");
    }

    #[test]
    fn test_unknown_stage_in_pipeline_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipwright.toml");
        std::fs::write(&path, "[pipelines]\ncustom = [\"implement\", \"shipit\"]\n").unwrap();

        let err = Config::load_from(Some(&path), &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStage { .. }));
    }

    #[test]
    fn test_invalid_provider_env_rejected() {
        let err =
            Config::load_from(None, &env(&[("SHIPWRIGHT_PROVIDER", "gemini")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_invalid_budget_env_rejected() {
        let err =
            Config::load_from(None, &env(&[("SHIPWRIGHT_TOKEN_BUDGET", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_bad_fraction_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipwright.toml");
        std::fs::write(&path, "[polish]\nbudget_abort_fraction = 1.5\n").unwrap();
        let err = Config::load_from(Some(&path), &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_timeout_env_override_reassembles_pipelines() {
        let cfg = Config::load_from(
            None,
            &env(&[("SHIPWRIGHT_HARD_TIMEOUT_SECS", "120")]),
        )
        .unwrap();
        let medium = cfg.pipeline_for_label("medium").unwrap();
        let implement = medium.stage(StageId::Implement).unwrap();
        assert_eq!(implement.hard_timeout, Duration::from_secs(120));
    }
}
