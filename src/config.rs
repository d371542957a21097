#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";
pub const DEFAULT_S3_REGION: &str = "auto";
pub const DEFAULT_JOB_HISTORY: usize = 500;
pub const DEFAULT_JOB_MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// Everything the server needs to boot, resolved from CLI overrides, the
/// process environment and the `.env` file (in that order of precedence).
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub work_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_path: PathBuf,
    pub storage: StorageSettings,
    pub retention: RetentionSettings,
}

/// Where downloaded videos end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSettings {
    /// No backend configured; downloads are refused up front.
    Disabled,
    S3(S3Settings),
    /// Plain directory on disk, handy for development without an S3 endpoint.
    Local {
        root: PathBuf,
        public_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub public_url: Option<String>,
    pub allow_http: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSettings {
    pub max_finished: usize,
    pub max_age: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_finished: DEFAULT_JOB_HISTORY,
            max_age: Duration::from_secs(DEFAULT_JOB_MAX_AGE_SECS),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: Overrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    build_settings_with_overrides(file_vars, env_lookup, Overrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: Overrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_dir = overrides
        .data_dir
        .or_else(|| lookup("TUBESHELF_DATA_DIR").map(PathBuf::from))
        .ok_or_else(|| anyhow!("TUBESHELF_DATA_DIR not set"))?;
    let work_dir = overrides
        .work_dir
        .or_else(|| lookup("TUBESHELF_WORK_DIR").map(PathBuf::from))
        .unwrap_or_else(|| env::temp_dir().join("tubeshelf"));
    let port = overrides
        .port
        .or_else(|| lookup("TUBESHELF_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBESHELF_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let ytdlp_path = lookup("YTDLP_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PATH));

    let retention = RetentionSettings {
        max_finished: lookup("TUBESHELF_JOB_HISTORY")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_JOB_HISTORY)
            .max(1),
        max_age: Duration::from_secs(
            lookup("TUBESHELF_JOB_MAX_AGE_SECS")
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_JOB_MAX_AGE_SECS),
        ),
    };

    Ok(Settings {
        data_dir,
        work_dir,
        host,
        port,
        ytdlp_path,
        storage: storage_settings(&lookup),
        retention,
    })
}

/// S3 wins when all four mandatory keys are present; a local directory is
/// only used when S3 is not configured at all.
fn storage_settings(lookup: &impl Fn(&str) -> Option<String>) -> StorageSettings {
    let public_url = lookup("S3_PUBLIC_URL").map(|url| url.trim_end_matches('/').to_string());

    if let (Some(endpoint), Some(bucket), Some(access_key_id), Some(secret_access_key)) = (
        lookup("S3_ENDPOINT"),
        lookup("S3_BUCKET"),
        lookup("S3_ACCESS_KEY_ID"),
        lookup("S3_SECRET_ACCESS_KEY"),
    ) {
        return StorageSettings::S3(S3Settings {
            endpoint,
            bucket,
            region: lookup("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            access_key_id,
            secret_access_key,
            public_url,
            allow_http: lookup("S3_ALLOW_HTTP").is_some_and(|value| parse_flag(&value)),
        });
    }

    match lookup("TUBESHELF_LOCAL_STORAGE") {
        Some(root) => StorageSettings::Local {
            root: PathBuf::from(root),
            public_url,
        },
        None => StorageSettings::Disabled,
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
