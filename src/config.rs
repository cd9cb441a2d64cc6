//! Configuration types.
//!
//! Every value has a default; `Config::from_env` overrides them from
//! `ORCH_`-prefixed environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::ModelTier;

/// Orchestrator loop configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Maximum number of concurrently running workers.
    pub max_workers: usize,
    /// An assigned task not claimed within this window is recovered.
    pub assign_timeout: Duration,
    /// A running task whose worker was silent this long is recovered.
    pub stale_threshold: Duration,
    /// Stale recoveries of a live task that raise the cycle flag.
    pub cycle_threshold: u32,
    /// Idle liveness records older than this are pruned.
    pub liveness_retention: Duration,
    /// How long shutdown waits for runners before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            max_workers: 4,
            assign_timeout: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(600), // 10 minutes
            cycle_threshold: 2,
            liveness_retention: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Per-runner execution limits.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_turns: usize,
    pub tier: ModelTier,
    /// Timeout of a single inference call.
    pub llm_timeout: Duration,
    /// Extra attempts after a transient inference failure.
    pub llm_retries: u32,
    /// Re-check ownership every this many turns.
    pub liveness_every: usize,
    /// Liveness refresh period while a task runs, independent of turns.
    pub heartbeat_every: Duration,
    /// Default timeout for `exec`.
    pub tool_timeout: Duration,
    /// Tool output above this many bytes is truncated.
    pub max_output_bytes: usize,
    /// Root directory for local file tools and commands.
    pub working_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            tier: ModelTier::Standard,
            llm_timeout: Duration::from_secs(120),
            llm_retries: 1,
            liveness_every: 3,
            heartbeat_every: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(120),
            max_output_bytes: 64 * 1024,
            working_dir: PathBuf::from("./workspace"),
        }
    }
}

/// Diagnostic thresholds. Independent of the recovery thresholds above.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub dispatch_deadlock: Duration,
    pub worker_stale: Duration,
    pub worker_zombie: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            dispatch_deadlock: Duration::from_secs(30),
            worker_stale: Duration::from_secs(120),
            worker_zombie: Duration::from_secs(600),
        }
    }
}

/// Anthropic provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub fast_model: String,
    pub standard_model: String,
    pub strong_model: String,
    pub max_tokens: u32,
}

impl LlmConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            base_url: "https://api.anthropic.com/v1".to_string(),
            fast_model: "claude-3-5-haiku-latest".to_string(),
            standard_model: "claude-sonnet-4-5".to_string(),
            strong_model: "claude-opus-4-1".to_string(),
            max_tokens: 4096,
        }
    }

    pub fn model(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Standard => &self.standard_model,
            ModelTier::Strong => &self.strong_model,
        }
    }
}

/// HTTP surface configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: String,
    /// Bearer token for the admin routes. Admin routes are off when unset.
    pub admin_token: Option<SecretString>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            admin_token: None,
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub orchestrator: OrchestratorConfig,
    pub worker: WorkerConfig,
    pub health: HealthThresholds,
    pub llm: LlmConfig,
    pub api: ApiConfig,
    /// Optional directory for daily rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Optional JSON goal plan seeded at startup.
    pub goal_file: Option<PathBuf>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let api_key = env
            .string("ORCH_ANTHROPIC_API_KEY")
            .or_else(|| env.string("ANTHROPIC_API_KEY"))
            .ok_or_else(|| ConfigError::MissingEnvVar("ORCH_ANTHROPIC_API_KEY".to_string()))?;
        let mut llm = LlmConfig::new(SecretString::from(api_key));
        if let Some(url) = env.string("ORCH_LLM_BASE_URL") {
            llm.base_url = url;
        }
        if let Some(model) = env.string("ORCH_MODEL_FAST") {
            llm.fast_model = model;
        }
        if let Some(model) = env.string("ORCH_MODEL_STANDARD") {
            llm.standard_model = model;
        }
        if let Some(model) = env.string("ORCH_MODEL_STRONG") {
            llm.strong_model = model;
        }
        llm.max_tokens = env.parse("ORCH_LLM_MAX_TOKENS", llm.max_tokens)?;

        let d = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            tick_interval: env.secs("ORCH_TICK_SECS", d.tick_interval)?,
            max_workers: env.parse("ORCH_MAX_WORKERS", d.max_workers)?,
            assign_timeout: env.secs("ORCH_ASSIGN_TIMEOUT_SECS", d.assign_timeout)?,
            stale_threshold: env.secs("ORCH_STALE_THRESHOLD_SECS", d.stale_threshold)?,
            cycle_threshold: env.parse("ORCH_CYCLE_THRESHOLD", d.cycle_threshold)?,
            liveness_retention: env.secs("ORCH_LIVENESS_RETENTION_SECS", d.liveness_retention)?,
            shutdown_grace: env.secs("ORCH_SHUTDOWN_GRACE_SECS", d.shutdown_grace)?,
        };
        if orchestrator.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_MAX_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let d = WorkerConfig::default();
        let worker = WorkerConfig {
            max_turns: env.parse("ORCH_MAX_TURNS", d.max_turns)?,
            tier: match env.string("ORCH_MODEL_TIER").as_deref() {
                None => d.tier,
                Some("fast") => ModelTier::Fast,
                Some("standard") => ModelTier::Standard,
                Some("strong") => ModelTier::Strong,
                Some(other) => {
                    return Err(ConfigError::InvalidValue {
                        key: "ORCH_MODEL_TIER".to_string(),
                        message: format!("expected fast, standard or strong, got '{other}'"),
                    });
                }
            },
            llm_timeout: env.secs("ORCH_LLM_TIMEOUT_SECS", d.llm_timeout)?,
            llm_retries: env.parse("ORCH_LLM_RETRIES", d.llm_retries)?,
            liveness_every: env.parse::<usize>("ORCH_LIVENESS_EVERY_TURNS", d.liveness_every)?.max(1),
            heartbeat_every: env.secs("ORCH_HEARTBEAT_SECS", d.heartbeat_every)?,
            tool_timeout: env.secs("ORCH_TOOL_TIMEOUT_SECS", d.tool_timeout)?,
            max_output_bytes: env.parse("ORCH_MAX_OUTPUT_BYTES", d.max_output_bytes)?,
            working_dir: env.string("ORCH_WORKING_DIR").map(PathBuf::from).unwrap_or(d.working_dir),
        };

        let d = HealthThresholds::default();
        let health = HealthThresholds {
            dispatch_deadlock: env.secs("ORCH_HEALTH_DISPATCH_DEADLOCK_SECS", d.dispatch_deadlock)?,
            worker_stale: env.secs("ORCH_HEALTH_WORKER_STALE_SECS", d.worker_stale)?,
            worker_zombie: env.secs("ORCH_HEALTH_WORKER_ZOMBIE_SECS", d.worker_zombie)?,
        };

        let api = ApiConfig {
            bind: env.string("ORCH_BIND").unwrap_or_else(|| ApiConfig::default().bind),
            admin_token: env.string("ORCH_ADMIN_TOKEN").map(SecretString::from),
        };

        Ok(Self {
            database_path: env
                .string("ORCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/orchestrator.db")),
            orchestrator,
            worker,
            health,
            llm,
            api,
            log_dir: env.string("ORCH_LOG_DIR").map(PathBuf::from),
            goal_file: env.string("ORCH_GOAL_FILE").map(PathBuf::from),
        })
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_with_only_api_key() {
        let config = load(&[("ANTHROPIC_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.llm.api_key.expose_secret(), "sk-test");
        assert_eq!(config.orchestrator.tick_interval, Duration::from_secs(5));
        assert_eq!(config.worker.max_turns, 25);
        assert_eq!(config.worker.liveness_every, 3);
        assert_eq!(config.worker.heartbeat_every, Duration::from_secs(30));
        assert_eq!(config.health.dispatch_deadlock, Duration::from_secs(30));
        assert!(config.api.admin_token.is_none());
        assert!(config.goal_file.is_none());
    }

    #[test]
    fn missing_api_key_is_an_error() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("ORCH_ANTHROPIC_API_KEY", "sk"),
            ("ORCH_MAX_WORKERS", "8"),
            ("ORCH_STALE_THRESHOLD_SECS", "90"),
            ("ORCH_MODEL_TIER", "fast"),
            ("ORCH_ADMIN_TOKEN", "secret"),
        ])
        .unwrap();
        assert_eq!(config.orchestrator.max_workers, 8);
        assert_eq!(config.orchestrator.stale_threshold, Duration::from_secs(90));
        assert_eq!(config.worker.tier, ModelTier::Fast);
        assert_eq!(config.llm.model(ModelTier::Fast), "claude-3-5-haiku-latest");
        assert!(config.api.admin_token.is_some());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = load(&[("ANTHROPIC_API_KEY", "sk"), ("ORCH_TICK_SECS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ORCH_TICK_SECS"));

        let err = load(&[("ANTHROPIC_API_KEY", "sk"), ("ORCH_MAX_WORKERS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = load(&[("ANTHROPIC_API_KEY", "sk"), ("ORCH_MODEL_TIER", "huge")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
