use std::collections::HashMap;

use chrono::Duration;
use envconfig::Envconfig;

/// Annotations recognized on target namespaces.
pub const ANNOTATION_PREFIX: &str = "resizer.io/";
/// Opt-out switch, default enabled. Value "false" disables the resizer.
pub const ANNOTATION_ENABLED: &str = "resizer.io/enabled";
/// Per-namespace auto-merge opt-out; absent means the process-wide flag.
pub const ANNOTATION_AUTO_MERGE: &str = "resizer.io/auto-merge";
/// Overrides the repository directory resolved from the path template.
pub const ANNOTATION_GIT_PATH: &str = "resizer.io/git-path";

const SUFFIX_THRESHOLD: &str = "-threshold";
const SUFFIX_INCREMENT: &str = "-increment";
const KEY_COOLDOWN: &str = "cooldown-minutes";
const DEFAULT_KEY: &str = "default";

pub const BUILTIN_THRESHOLD_PCT: f64 = 80.0;
pub const BUILTIN_GROWTH_FACTOR: f64 = 0.2;
pub const BUILTIN_COOLDOWN_MINUTES: i64 = 60;

#[derive(Envconfig, Clone, Debug)]
pub struct ResizerConfig {
    /// Git provider backend: github | github-app | log | stateful.
    /// Env: RESIZER_PROVIDER
    #[envconfig(from = "RESIZER_PROVIDER", default = "github")]
    pub provider: String,

    #[envconfig(from = "RESIZER_GITHUB_OWNER", default = "")]
    pub github_owner: String,

    #[envconfig(from = "RESIZER_GITHUB_REPO", default = "")]
    pub github_repo: String,

    /// Personal access token auth. Ignored when the app identity is set.
    /// Env: RESIZER_GITHUB_TOKEN
    #[envconfig(from = "RESIZER_GITHUB_TOKEN")]
    pub github_token: Option<String>,

    #[envconfig(from = "RESIZER_GITHUB_APP_ID")]
    pub github_app_id: Option<i64>,

    #[envconfig(from = "RESIZER_GITHUB_APP_INSTALLATION_ID")]
    pub github_app_installation_id: Option<i64>,

    /// Path to the app's RS256 private key (PEM).
    /// Env: RESIZER_GITHUB_APP_PRIVATE_KEY_PATH
    #[envconfig(from = "RESIZER_GITHUB_APP_PRIVATE_KEY_PATH")]
    pub github_app_private_key_path: Option<String>,

    /// Base URL of the GitHub API, overridable for GHES and tests.
    /// Env: RESIZER_GITHUB_API_URL
    #[envconfig(
        from = "RESIZER_GITHUB_API_URL",
        default = "https://api.github.com"
    )]
    pub github_api_url: String,

    /// Cluster identifier rendered into the path template.
    /// Env: RESIZER_CLUSTER_NAME
    #[envconfig(from = "RESIZER_CLUSTER_NAME", default = "default")]
    pub cluster_name: String,

    /// Template for the repository directory holding a namespace's
    /// manifests; `{cluster}` and `{namespace}` are substituted.
    /// Env: RESIZER_GIT_PATH_TEMPLATE
    #[envconfig(
        from = "RESIZER_GIT_PATH_TEMPLATE",
        default = "clusters/{cluster}/{namespace}"
    )]
    pub git_path_template: String,

    /// Process-wide auto-merge switch; namespaces can opt out.
    /// Env: RESIZER_AUTO_MERGE
    #[envconfig(from = "RESIZER_AUTO_MERGE", default = "false")]
    pub auto_merge: bool,

    /// Namespace the controller runs in and stores lease records in.
    /// Env: RESIZER_NAMESPACE
    #[envconfig(from = "RESIZER_NAMESPACE", default = "quota-resizer-system")]
    pub controller_namespace: String,

    /// Lease garbage-collection interval in hours.
    /// Env: RESIZER_GC_INTERVAL_HOURS
    #[envconfig(from = "RESIZER_GC_INTERVAL_HOURS", default = "12")]
    pub gc_interval_hours: u64,

    /// Default usage threshold percentage when no annotation overrides it.
    /// Env: RESIZER_DEFAULT_THRESHOLD
    #[envconfig(from = "RESIZER_DEFAULT_THRESHOLD", default = "80")]
    pub default_threshold_pct: f64,

    /// Default growth factor, fractional or "NN%".
    /// Env: RESIZER_DEFAULT_INCREMENT
    #[envconfig(from = "RESIZER_DEFAULT_INCREMENT", default = "0.2")]
    pub default_increment: String,

    /// Default cooldown between merged proposals, in minutes.
    /// Env: RESIZER_DEFAULT_COOLDOWN_MINUTES
    #[envconfig(from = "RESIZER_DEFAULT_COOLDOWN_MINUTES", default = "60")]
    pub default_cooldown_minutes: i64,
}

/// Built-in / process-level defaults feeding [`NamespacePolicy`].
#[derive(Clone, Debug)]
pub struct PolicyDefaults {
    pub threshold_pct: f64,
    pub growth_factor: f64,
    pub cooldown: Duration,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            threshold_pct: BUILTIN_THRESHOLD_PCT,
            growth_factor: BUILTIN_GROWTH_FACTOR,
            cooldown: Duration::minutes(BUILTIN_COOLDOWN_MINUTES),
        }
    }
}

impl ResizerConfig {
    pub fn policy_defaults(&self) -> PolicyDefaults {
        PolicyDefaults {
            threshold_pct: self.default_threshold_pct,
            growth_factor: parse_growth_factor(&self.default_increment)
                .unwrap_or(BUILTIN_GROWTH_FACTOR),
            cooldown: Duration::minutes(self.default_cooldown_minutes),
        }
    }
}

/// Per-namespace overrides read from `resizer.io/*` annotations.
///
/// Lookup order for thresholds and growth factors: exact resource name,
/// resource family (any name containing cpu/memory/storage), explicit
/// `default` annotation, built-in default.
#[derive(Clone, Debug)]
pub struct NamespacePolicy {
    thresholds: HashMap<String, f64>,
    growth: HashMap<String, f64>,
    pub cooldown: Duration,
    pub enabled: bool,
    pub auto_merge: Option<bool>,
    pub git_path: Option<String>,
    defaults: PolicyDefaults,
}

impl NamespacePolicy {
    pub fn from_annotations<'a, I>(annotations: I, defaults: &PolicyDefaults) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut policy = Self {
            thresholds: HashMap::new(),
            growth: HashMap::new(),
            cooldown: defaults.cooldown,
            enabled: true,
            auto_merge: None,
            git_path: None,
            defaults: defaults.clone(),
        };

        for (k, v) in annotations {
            let Some(key) = k.strip_prefix(ANNOTATION_PREFIX) else {
                continue;
            };
            match key {
                "enabled" => policy.enabled = v != "false",
                "auto-merge" => policy.auto_merge = Some(v != "false"),
                "git-path" => policy.git_path = Some(v.clone()),
                KEY_COOLDOWN => {
                    if let Ok(mins) = v.parse::<i64>() {
                        policy.cooldown = Duration::minutes(mins);
                    }
                }
                _ => {
                    if let Some(res) = key.strip_suffix(SUFFIX_THRESHOLD) {
                        if let Ok(pct) = v.parse::<f64>() {
                            policy
                                .thresholds
                                .insert(normalize_key(res), pct);
                        }
                    } else if let Some(res) = key.strip_suffix(SUFFIX_INCREMENT)
                    {
                        if let Some(factor) = parse_growth_factor(v) {
                            policy.growth.insert(normalize_key(res), factor);
                        }
                    }
                }
            }
        }

        policy
    }

    pub fn threshold(&self, res: &str) -> f64 {
        lookup(&self.thresholds, res).unwrap_or(self.defaults.threshold_pct)
    }

    pub fn growth(&self, res: &str) -> f64 {
        lookup(&self.growth, res).unwrap_or(self.defaults.growth_factor)
    }
}

fn normalize_key(res: &str) -> String {
    if res.is_empty() {
        DEFAULT_KEY.to_string()
    } else {
        res.to_string()
    }
}

fn lookup(map: &HashMap<String, f64>, res: &str) -> Option<f64> {
    if let Some(v) = map.get(res) {
        return Some(*v);
    }
    for family in ["cpu", "memory", "storage"] {
        if res.contains(family) {
            if let Some(v) = map.get(family) {
                return Some(*v);
            }
        }
    }
    map.get(DEFAULT_KEY).copied()
}

/// Parse a growth factor: `"0.2"` and `"20%"` both mean 20 %.
///
/// Bare values above 1.0 without a `%` suffix are rejected; a typo'd
/// `"20"` must not become a 2000 % increment.
pub fn parse_growth_factor(val: &str) -> Option<f64> {
    let trimmed = val.trim();
    if let Some(pct) = trimmed.strip_suffix('%') {
        let v: f64 = pct.trim().parse().ok()?;
        if v < 0.0 {
            return None;
        }
        return Some(v / 100.0);
    }
    let v: f64 = trimmed.parse().ok()?;
    if !(0.0..=1.0).contains(&v) {
        return None;
    }
    Some(v)
}
