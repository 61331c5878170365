//! Limiter configuration: the per-resource limits table and the policies around it.
//!
//! Configuration is read once at startup (JSON via [`LimiterConfig::from_path`] or
//! [`LimiterConfig::from_json_str`], or built in code with [`LimiterConfig::builder`]).
//!
//! ```rust
//! use ratekeeper::config::{LimiterConfig, StartingAllowance};
//!
//! let cfg = LimiterConfig::from_json_str(r#"{
//!     "starting_allowance": { "fixed": 100 },
//!     "limits": {
//!         "search": { "capacity": 100, "period_seconds": 60, "refill_amount": 10 },
//!         "export": { "capacity": 5, "seconds": 3600, "refill": 1, "persistent": true }
//!     }
//! }"#).unwrap();
//!
//! assert_eq!(cfg.starting_allowance(), StartingAllowance::Fixed(100));
//! assert!(cfg.limits_for("export").unwrap().persistent());
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bucket::BucketError;
use crate::cache::KEY_SEPARATOR;
use crate::error::LimiterError;

/// Capacity used for resources without an explicit entry.
pub const DEFAULT_CAPACITY: u32 = 1;
/// Refill period used for resources without an explicit entry.
pub const DEFAULT_PERIOD_SECONDS: u32 = 3600;
/// Refill amount used for resources without an explicit entry.
pub const DEFAULT_REFILL_AMOUNT: u32 = 1;
/// Store key namespace used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "ratekeeper";

/// Validated limits for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLimitSpec")]
pub struct LimitSpec {
    capacity: u32,
    period_seconds: u32,
    refill_amount: u32,
    persistent: bool,
}

impl LimitSpec {
    /// Create limits, rejecting zero capacity, period, or refill amount.
    pub fn new(
        capacity: u32,
        period_seconds: u32,
        refill_amount: u32,
        persistent: bool,
    ) -> Result<Self, BucketError> {
        if capacity == 0 {
            return Err(BucketError::InvalidCapacity { provided: capacity });
        }
        if period_seconds == 0 {
            return Err(BucketError::InvalidPeriod { provided: period_seconds });
        }
        if refill_amount == 0 {
            return Err(BucketError::InvalidRefill { provided: refill_amount });
        }
        Ok(Self { capacity, period_seconds, refill_amount, persistent })
    }

    pub(crate) fn from_validated(
        capacity: u32,
        period_seconds: u32,
        refill_amount: u32,
        persistent: bool,
    ) -> Self {
        Self { capacity, period_seconds, refill_amount, persistent }
    }

    /// `capacity=1, period_seconds=3600, refill_amount=1, persistent=false`.
    pub fn fallback() -> Self {
        Self::from_validated(DEFAULT_CAPACITY, DEFAULT_PERIOD_SECONDS, DEFAULT_REFILL_AMOUNT, false)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn period_seconds(&self) -> u32 {
        self.period_seconds
    }

    pub fn refill_amount(&self) -> u32 {
        self.refill_amount
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// Mark the limits as persistent (or not).
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

impl Default for LimitSpec {
    fn default() -> Self {
        Self::fallback()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimitSpec {
    #[serde(default = "default_capacity")]
    capacity: u32,
    #[serde(default = "default_period", alias = "seconds")]
    period_seconds: u32,
    #[serde(default = "default_refill", alias = "refill")]
    refill_amount: u32,
    #[serde(default)]
    persistent: bool,
}

fn default_capacity() -> u32 {
    DEFAULT_CAPACITY
}

fn default_period() -> u32 {
    DEFAULT_PERIOD_SECONDS
}

fn default_refill() -> u32 {
    DEFAULT_REFILL_AMOUNT
}

impl TryFrom<RawLimitSpec> for LimitSpec {
    type Error = BucketError;

    fn try_from(raw: RawLimitSpec) -> Result<Self, Self::Error> {
        LimitSpec::new(raw.capacity, raw.period_seconds, raw.refill_amount, raw.persistent)
    }
}

/// Tokens a freshly provisioned bucket starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartingAllowance {
    /// Start full: `token = capacity`.
    #[default]
    Capacity,
    /// Start with a fixed welcome grant regardless of capacity.
    Fixed(u32),
}

impl StartingAllowance {
    /// The fixed welcome grant historically given to every new bucket.
    pub const WELCOME_GRANT: StartingAllowance = StartingAllowance::Fixed(100);

    /// Starting token count for a bucket with `spec`.
    pub fn tokens_for(&self, spec: &LimitSpec) -> i64 {
        match self {
            StartingAllowance::Capacity => i64::from(spec.capacity()),
            StartingAllowance::Fixed(n) => i64::from(*n),
        }
    }
}

/// What to do when a resource has no entry in the limits table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownResourcePolicy {
    /// Provision with [`LimitSpec::fallback`].
    #[default]
    #[serde(rename = "defaults")]
    UseDefaults,
    /// Fail with [`LimiterError::UnknownResource`].
    Reject,
}

/// How `take` talks to the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Refill, check, and debit in one store-side step when the client supports it.
    #[default]
    Atomic,
    /// Separate read, increment, and timestamp round-trips. Concurrent takes on the
    /// same bucket can over-admit.
    MultiStep,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid limits for resource '{resource}': {source}")]
    InvalidLimit { resource: String, source: BucketError },
    #[error("invalid key prefix {0:?}: must be non-empty without whitespace, control characters, or ':'")]
    InvalidKeyPrefix(String),
    #[error("fixed starting allowance must be > 0")]
    ZeroStartingAllowance,
}

/// Process-wide, read-only limits table plus provisioning policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    limits: HashMap<String, LimitSpec>,
    key_prefix: String,
    starting_allowance: StartingAllowance,
    unknown_resource: UnknownResourcePolicy,
    consistency: ConsistencyMode,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            starting_allowance: StartingAllowance::default(),
            unknown_resource: UnknownResourcePolicy::default(),
            consistency: ConsistencyMode::default(),
        }
    }
}

impl LimiterConfig {
    /// Start building a configuration in code.
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder { config: LimiterConfig::default() }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: LimiterConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse, and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.key_prefix;
        let bad = |c: char| c.is_whitespace() || c.is_control() || c == KEY_SEPARATOR;
        if prefix.is_empty() || prefix.chars().any(bad) {
            return Err(ConfigError::InvalidKeyPrefix(prefix.clone()));
        }
        if self.starting_allowance == StartingAllowance::Fixed(0) {
            return Err(ConfigError::ZeroStartingAllowance);
        }
        Ok(())
    }

    /// Explicitly configured limits for `resource`.
    pub fn limits_for(&self, resource: &str) -> Option<&LimitSpec> {
        self.limits.get(resource)
    }

    /// Limits to provision `resource` with, applying the unknown-resource policy.
    pub fn resolve_limits(&self, resource: &str) -> Result<LimitSpec, LimiterError> {
        match (self.limits.get(resource), self.unknown_resource) {
            (Some(spec), _) => Ok(*spec),
            (None, UnknownResourcePolicy::UseDefaults) => Ok(LimitSpec::fallback()),
            (None, UnknownResourcePolicy::Reject) => {
                Err(LimiterError::UnknownResource { resource: resource.to_string() })
            }
        }
    }

    /// Whether `resource` is configured persistent. Unknown resources never are.
    pub fn is_persistent(&self, resource: &str) -> bool {
        self.limits.get(resource).map(LimitSpec::persistent).unwrap_or(false)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn starting_allowance(&self) -> StartingAllowance {
        self.starting_allowance
    }

    pub fn unknown_resource(&self) -> UnknownResourcePolicy {
        self.unknown_resource
    }

    pub fn consistency(&self) -> ConsistencyMode {
        self.consistency
    }

    /// Number of configured resources.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Builder for [`LimiterConfig`].
#[derive(Debug, Clone)]
pub struct LimiterConfigBuilder {
    config: LimiterConfig,
}

impl LimiterConfigBuilder {
    /// Set limits for a resource, replacing any previous entry.
    pub fn limit(mut self, resource: impl Into<String>, spec: LimitSpec) -> Self {
        self.config.limits.insert(resource.into(), spec);
        self
    }

    /// Validate and add limits for a resource.
    pub fn try_limit(
        self,
        resource: impl Into<String>,
        capacity: u32,
        period_seconds: u32,
        refill_amount: u32,
        persistent: bool,
    ) -> Result<Self, ConfigError> {
        let resource = resource.into();
        match LimitSpec::new(capacity, period_seconds, refill_amount, persistent) {
            Ok(spec) => Ok(self.limit(resource, spec)),
            Err(source) => Err(ConfigError::InvalidLimit { resource, source }),
        }
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn starting_allowance(mut self, allowance: StartingAllowance) -> Self {
        self.config.starting_allowance = allowance;
        self
    }

    pub fn unknown_resource(mut self, policy: UnknownResourcePolicy) -> Self {
        self.config.unknown_resource = policy;
        self
    }

    pub fn consistency(mut self, mode: ConsistencyMode) -> Self {
        self.config.consistency = mode;
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
