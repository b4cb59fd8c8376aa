use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use backfill_types::error::{BackfillError, Result};
use backfill_types::image_spec::ImageSpec;

use super::types::*;
use super::util::expand_tilde;

/// Env var naming the config file, consulted after `--config`.
pub const CONFIG_ENV_VAR: &str = "RBD_BACKFILL_CONFIG";

/// Substitute `${VAR}` and `${VAR:-default}` in raw config text. The
/// default applies when the variable is unset or empty.
fn expand_env_placeholders(input: &str, path: &Path) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        let at = input.len() - rest.len() + open;
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let close = body
            .find('}')
            .ok_or_else(|| expand_error(path, input, at, "unterminated environment placeholder"))?;
        let value = placeholder_value(&body[..close]).map_err(|msg| expand_error(path, input, at, msg))?;
        out.push_str(&value);
        rest = &body[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn placeholder_value(token: &str) -> std::result::Result<String, String> {
    if token.is_empty() {
        return Err("empty environment placeholder".into());
    }
    let (name, default) = match token.split_once(":-") {
        Some((n, d)) => (n, Some(d)),
        None => (token, None),
    };
    let valid_name = name.starts_with(|c: char| c == '_' || c.is_ascii_alphabetic())
        && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric());
    if !valid_name {
        return Err(format!("invalid environment variable name '{name}'"));
    }
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        Ok(v) => Ok(default.map_or(v, str::to_string)),
        Err(std::env::VarError::NotPresent) => default
            .map(str::to_string)
            .ok_or_else(|| format!("environment variable '{name}' is not set")),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(format!("environment variable '{name}' is not valid UTF-8"))
        }
    }
}

/// Config error pointing at the 1-based line and column of byte `at`.
fn expand_error(path: &Path, input: &str, at: usize, message: impl fmt::Display) -> BackfillError {
    let before = &input[..at];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = before[line_start..].chars().count() + 1;
    BackfillError::Config(format!(
        "invalid config '{}': {message} at line {line}, column {column}",
        path.display()
    ))
}

/// Read, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<BackfillConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| BackfillError::Config(format!("cannot read '{}': {e}", path.display())))?;
    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> Result<BackfillConfig> {
    let expanded = expand_env_placeholders(contents, path)?;
    let config: BackfillConfig = serde_yaml::from_str(&expanded)
        .map_err(|e| BackfillError::Config(format!("invalid config '{}': {e}", path.display())))?;
    finish_config(config)
}

fn finish_config(mut config: BackfillConfig) -> Result<BackfillConfig> {
    if config.cluster.path.trim().is_empty() {
        return Err(BackfillError::Config("'cluster.path' must not be empty".into()));
    }
    config.cluster.path = expand_tilde(&config.cluster.path);

    let mut names = HashSet::new();
    for remote in &mut config.remote_clusters {
        if remote.name.is_empty() {
            return Err(BackfillError::Config(
                "remote cluster entries need a 'name'".into(),
            ));
        }
        if !names.insert(remote.name.clone()) {
            return Err(BackfillError::Config(format!(
                "duplicate remote cluster: '{}'",
                remote.name
            )));
        }
        for field in [&mut remote.path, &mut remote.conf, &mut remote.keyring] {
            if let Some(p) = field.as_mut() {
                *p = expand_tilde(p);
            }
        }
    }

    for image in &config.images {
        image
            .parse::<ImageSpec>()
            .map_err(|e| BackfillError::Config(format!("images: {e}")))?;
    }

    if config.backfill.worker_threads == 0 {
        return Err(BackfillError::Config(
            "'backfill.worker_threads' must be at least 1".into(),
        ));
    }
    if config.backfill.lock_duration_secs == 0 {
        return Err(BackfillError::Config(
            "'backfill.lock_duration_secs' must be at least 1".into(),
        ));
    }
    if let Some(file) = config.log.file.as_mut() {
        *file = expand_tilde(file);
    }

    Ok(config)
}

/// How a config file was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    Flag,
    Env,
    /// First existing entry of [`default_config_search_paths`], by level.
    Search(&'static str),
}

#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    pub origin: ConfigOrigin,
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            ConfigOrigin::Flag => "--config",
            ConfigOrigin::Env => CONFIG_ENV_VAR,
            ConfigOrigin::Search(level) => level,
        };
        write!(f, "{} ({origin})", self.path.display())
    }
}

/// Candidate locations, highest priority first: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let user_base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")));

    let mut paths = vec![(PathBuf::from("rbd-backfill.yaml"), "project")];
    paths.extend(user_base.map(|b| (b.join("rbd-backfill/config.yaml"), "user")));
    paths.push((PathBuf::from("/etc/rbd-backfill/config.yaml"), "system"));
    paths
}

/// `--config`, else a non-empty `RBD_BACKFILL_CONFIG`, else the first search
/// path that exists.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    let explicit = cli_config
        .map(|p| (PathBuf::from(p), ConfigOrigin::Flag))
        .or_else(|| {
            std::env::var(CONFIG_ENV_VAR)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (PathBuf::from(v), ConfigOrigin::Env))
        });
    let (path, origin) = explicit.or_else(|| {
        default_config_search_paths()
            .into_iter()
            .find(|(p, _)| p.exists())
            .map(|(p, level)| (p, ConfigOrigin::Search(level)))
    })?;
    Some(ConfigSource { path, origin })
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# rbd-backfill configuration file

cluster:
  path: /var/lib/rbd-backfill/cluster

# --- Common optional settings (uncomment as needed) ---

# pools:
#   - rbd
#
# images:
#   - "rbd/vm-disk-1"
#
# remote_clusters:
#   - name: backup
#     path: /var/lib/rbd-backfill/backup
#     keyring: /etc/ceph/backup.keyring
#
# backfill:
#   max_concurrent: 10
#   discovery_interval: 60s
#
# s3:
#   verify_tls: true
#   retry_delay_ms: 1000
"#
}
