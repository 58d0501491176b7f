use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which repository backs the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    /// In-process only; everything is lost on exit.
    Memory,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Sqlite => "sqlite",
            StoreKind::Memory => "memory",
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreKind::Sqlite),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration: optional TOML file, then `PRESENCE_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreKind,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Length of every feature vector.
    pub dimension: usize,
    /// Maximum normalized distance for a match (inclusive).
    pub match_threshold: f32,
    /// Per-frame matching budget in milliseconds; 0 disables the deadline.
    pub frame_deadline_ms: u64,
    /// Append a `duplicate-suppressed` record for every suppressed mark.
    pub audit_duplicates: bool,
    /// Key file for sealing face templates at rest.
    pub template_key_path: Option<PathBuf>,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            db_path: data_dir().join("attendance.db"),
            dimension: presence_core::DEFAULT_DIMENSION,
            match_threshold: presence_core::DEFAULT_THRESHOLD,
            frame_deadline_ms: 0,
            audit_duplicates: false,
            template_key_path: None,
            bus: BusKind::default(),
        }
    }
}

impl Config {
    /// Load from `PRESENCE_CONFIG` (must exist) or the default config file
    /// (optional), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("PRESENCE_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| config_dir().join("presenced.toml"));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                tracing::info!(path = %path.display(), "loading config file");
                Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            Err(err) if explicit.is_none() && err.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `PRESENCE_*` overrides. Unparsable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var(&lookup, "PRESENCE_STORE") {
            self.store = v;
        }
        if let Some(v) = lookup("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var(&lookup, "PRESENCE_DIMENSION") {
            self.dimension = v;
        }
        if let Some(v) = parse_var(&lookup, "PRESENCE_MATCH_THRESHOLD") {
            self.match_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "PRESENCE_FRAME_DEADLINE_MS") {
            self.frame_deadline_ms = v;
        }
        if let Some(v) = lookup("PRESENCE_AUDIT_DUPLICATES") {
            self.audit_duplicates = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = lookup("PRESENCE_TEMPLATE_KEY") {
            self.template_key_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = parse_var(&lookup, "PRESENCE_BUS") {
            self.bus = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            bail!("dimension must be positive");
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            bail!("match_threshold must be a non-negative number");
        }
        if self.store == StoreKind::Memory && self.template_key_path.is_some() {
            tracing::warn!("template_key_path has no effect with the memory store");
        }
        Ok(())
    }

    pub fn frame_deadline(&self) -> Option<Duration> {
        (self.frame_deadline_ms > 0).then(|| Duration::from_millis(self.frame_deadline_ms))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("presence")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("presence")
}
