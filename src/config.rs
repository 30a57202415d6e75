use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::{Classify, ErrorClass};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable missing: {}", names.join(", "))]
    Missing { names: Vec<&'static str> },

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

// ---------------------------------------------------------------------------
// Update policy
// ---------------------------------------------------------------------------

/// What to do when a mirror ref is not an ancestor of the snapshot ref.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Overwrite the remote ref.  The snapshot is authoritative.
    #[default]
    Force,
    /// Refuse the whole artifact if any ref would be rewritten.
    FastForwardOnly,
}

impl UpdatePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "force" | "forced" | "overwrite" => Some(Self::Force),
            "fast-forward-only" | "ff-only" | "fast-forward" => Some(Self::FastForwardOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Force => "force",
            Self::FastForwardOnly => "fast-forward-only",
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Immutable process configuration, read once from the environment.
#[derive(Debug)]
pub struct Config {
    pub storage: StorageConfig,
    pub gitlab: GitLabConfig,
    /// age identity file contents (one or more `AGE-SECRET-KEY-1...` lines).
    pub private_key: SecretString,
    /// Partition tag; only artifacts under this shard are considered.
    pub shard: String,
    pub reconcile_sleep: Duration,
    pub workdir: PathBuf,
    pub metrics_port: u16,
    pub sync: SyncConfig,
}

#[derive(Debug)]
pub struct StorageConfig {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub region: String,
    pub bucket: String,
    /// Key prefix in front of the shard name, e.g. `shard/`.
    pub key_prefix: String,
}

impl StorageConfig {
    /// Prefix under which every artifact of `shard` lives.
    pub fn shard_prefix(&self, shard: &str) -> String {
        format!("{}{}/", self.key_prefix, shard)
    }
}

#[derive(Debug)]
pub struct GitLabConfig {
    pub base_url: Url,
    pub username: String,
    pub token: SecretString,
    /// Namespace used for artifacts whose path has a single segment.
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub concurrency: usize,
    pub update_policy: UpdatePolicy,
    pub request_timeout: Duration,
    pub git_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            update_policy: UpdatePolicy::default(),
            request_timeout: Duration::from_secs(60),
            git_timeout: Duration::from_secs(600),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

const REQUIRED: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_REGION",
    "AWS_S3_BUCKET",
    "GITLAB_BASE_URL",
    "GITLAB_USERNAME",
    "GITLAB_TOKEN",
    "PRIVATE_KEY",
];

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.  All missing required variables are
    /// reported together.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let missing: Vec<&'static str> = REQUIRED
            .iter()
            .copied()
            .filter(|name| get(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing { names: missing });
        }
        // Every required variable is present past this point.
        let required = |name: &'static str| get(name).unwrap_or_default();
        let or_default = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let base_url = parse_base_url(&required("GITLAB_BASE_URL"))?;
        let username = required("GITLAB_USERNAME");
        let namespace = or_default("GITLAB_NAMESPACE", &username)
            .trim_matches('/')
            .to_string();

        let shard = or_default("INSTANCE_SHARD", "fedramp");
        if shard.contains('/') {
            return Err(ConfigError::Invalid {
                name: "INSTANCE_SHARD",
                reason: format!("shard name must not contain '/': {shard}"),
            });
        }

        let mut key_prefix = or_default("S3_KEY_PREFIX", "shard/");
        if !key_prefix.ends_with('/') {
            key_prefix.push('/');
        }

        let metrics_port = or_default("METRICS_SERVER_PORT", "9090")
            .parse::<u16>()
            .map_err(|e| ConfigError::Invalid {
                name: "METRICS_SERVER_PORT",
                reason: e.to_string(),
            })?;

        let concurrency = match get("SYNC_CONCURRENCY") {
            Some(v) => v
                .parse::<usize>()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "SYNC_CONCURRENCY",
                    reason: format!("expected a positive integer, got {v:?}"),
                })?,
            None => default_concurrency(),
        };

        let update_policy = match get("UPDATE_POLICY") {
            Some(v) => UpdatePolicy::parse(&v).ok_or_else(|| ConfigError::Invalid {
                name: "UPDATE_POLICY",
                reason: format!("expected `force` or `fast-forward-only`, got {v:?}"),
            })?,
            None => UpdatePolicy::default(),
        };

        Ok(Self {
            storage: StorageConfig {
                access_key_id: required("AWS_ACCESS_KEY_ID"),
                secret_access_key: SecretString::from(required("AWS_SECRET_ACCESS_KEY")),
                region: required("AWS_REGION"),
                bucket: required("AWS_S3_BUCKET"),
                key_prefix,
            },
            gitlab: GitLabConfig {
                base_url,
                username,
                token: SecretString::from(required("GITLAB_TOKEN")),
                namespace,
            },
            private_key: SecretString::from(required("PRIVATE_KEY")),
            shard,
            reconcile_sleep: parse_duration(
                "RECONCILE_SLEEP_TIME",
                &or_default("RECONCILE_SLEEP_TIME", "5m"),
            )?,
            workdir: PathBuf::from(or_default("WORKDIR", "/working")),
            metrics_port,
            sync: SyncConfig {
                concurrency,
                update_policy,
                request_timeout: parse_duration(
                    "REQUEST_TIMEOUT",
                    &or_default("REQUEST_TIMEOUT", "60s"),
                )?,
                git_timeout: parse_duration("GIT_TIMEOUT", &or_default("GIT_TIMEOUT", "10m"))?,
            },
        })
    }
}

fn parse_duration(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let d = humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Invalid {
        name,
        reason: format!("{value:?}: {e}"),
    })?;
    if d.is_zero() {
        return Err(ConfigError::Invalid {
            name,
            reason: "duration must be greater than zero".to_string(),
        });
    }
    Ok(d)
}

fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|e| ConfigError::Invalid {
        name: "GITLAB_BASE_URL",
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::Invalid {
            name: "GITLAB_BASE_URL",
            reason: format!("expected an http(s) URL with a host, got {value}"),
        });
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn full_env() -> HashMap<&'static str, String> {
        [
            ("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_REGION", "us-gov-west-1"),
            ("AWS_S3_BUCKET", "sync-bucket"),
            ("GITLAB_BASE_URL", "https://gitlab.example.com"),
            ("GITLAB_USERNAME", "sync-bot"),
            ("GITLAB_TOKEN", "glpat-xyz"),
            ("PRIVATE_KEY", "AGE-SECRET-KEY-1XYZ"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults_applied() {
        let config = load(&full_env()).unwrap();
        assert_eq!(config.shard, "fedramp");
        assert_eq!(config.reconcile_sleep, Duration::from_secs(300));
        assert_eq!(config.workdir, PathBuf::from("/working"));
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.storage.key_prefix, "shard/");
        assert_eq!(config.storage.shard_prefix(&config.shard), "shard/fedramp/");
        assert_eq!(config.gitlab.namespace, "sync-bot");
        assert_eq!(config.sync.update_policy, UpdatePolicy::Force);
        assert_eq!(config.sync.concurrency, 4);
        assert_eq!(config.gitlab.token.expose_secret(), "glpat-xyz");
    }

    #[test]
    fn missing_bucket_is_named() {
        let mut env = full_env();
        env.remove("AWS_S3_BUCKET");
        let err = load(&env).unwrap_err();
        match &err {
            ConfigError::Missing { names } => assert_eq!(names, &vec!["AWS_S3_BUCKET"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("AWS_S3_BUCKET"));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let mut env = full_env();
        env.insert("GITLAB_TOKEN", String::new());
        env.remove("PRIVATE_KEY");
        let err = load(&env).unwrap_err();
        let ConfigError::Missing { names } = err else {
            panic!("expected missing error");
        };
        assert_eq!(names, vec!["GITLAB_TOKEN", "PRIVATE_KEY"]);
    }

    #[test]
    fn overrides_parsed() {
        let mut env = full_env();
        env.insert("INSTANCE_SHARD", "il5".into());
        env.insert("RECONCILE_SLEEP_TIME", "1h30m".into());
        env.insert("S3_KEY_PREFIX", "snapshots".into());
        env.insert("UPDATE_POLICY", "fast-forward-only".into());
        env.insert("SYNC_CONCURRENCY", "8".into());
        env.insert("GITLAB_NAMESPACE", "/mirrors/".into());
        let config = load(&env).unwrap();
        assert_eq!(config.shard, "il5");
        assert_eq!(config.reconcile_sleep, Duration::from_secs(5400));
        assert_eq!(config.storage.shard_prefix("il5"), "snapshots/il5/");
        assert_eq!(config.sync.update_policy, UpdatePolicy::FastForwardOnly);
        assert_eq!(config.sync.concurrency, 8);
        assert_eq!(config.gitlab.namespace, "mirrors");
    }

    #[test]
    fn invalid_values_rejected() {
        let cases = [
            ("RECONCILE_SLEEP_TIME", "soon"),
            ("RECONCILE_SLEEP_TIME", "0s"),
            ("METRICS_SERVER_PORT", "99999"),
            ("SYNC_CONCURRENCY", "0"),
            ("UPDATE_POLICY", "merge"),
            ("GITLAB_BASE_URL", "ftp://gitlab.example.com"),
            ("INSTANCE_SHARD", "a/b"),
        ];
        for (name, value) in cases {
            let mut env = full_env();
            env.insert(name, value.to_string());
            match load(&env) {
                Err(ConfigError::Invalid { name: n, .. }) => assert_eq!(n, name),
                other => panic!("{name}={value}: expected invalid, got {other:?}"),
            }
        }
    }
}
