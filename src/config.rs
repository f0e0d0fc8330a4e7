use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::wsproto::{DEFAULT_NAME, DEFAULT_ROOM};

static ROOM_PATTERN: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$"));

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server_url: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_room")]
    pub room: String,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_true")]
    pub direct_enabled: bool,
    #[serde(default = "default_direct_timeout_ms")]
    pub direct_timeout_ms: u64,
    #[serde(default = "default_consent_timeout_ms")]
    pub consent_timeout_ms: u64,
    #[serde(default = "default_direct_bind")]
    pub direct_bind: String,
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
    // set when normalize had to mint a peer id
    #[serde(skip)]
    peer_id_minted: bool,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_true() -> bool {
    true
}

fn default_direct_timeout_ms() -> u64 {
    12_000
}

fn default_consent_timeout_ms() -> u64 {
    15_000
}

fn default_direct_bind() -> String {
    "127.0.0.1:0".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults for everything but the server, used when no file is given.
    pub fn default_for(server_url: &str) -> Result<Self> {
        let mut cfg: Config = serde_json::from_value(serde_json::json!({ "server_url": server_url }))
            .context("build default config")?;
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Re-run normalisation and validation after CLI overrides.
    pub fn finish(&mut self) -> Result<()> {
        self.normalize()?;
        self.validate()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("write config {}", path.display()))
    }

    /// Write a freshly minted peer id back to the file the config came from,
    /// so the next run announces the same identity. Returns whether it wrote.
    pub fn persist_identity(&mut self) -> Result<bool> {
        let Some(path) = self.config_path.clone() else {
            return Ok(false);
        };
        if !self.peer_id_minted {
            return Ok(false);
        }
        self.save(&path)?;
        self.peer_id_minted = false;
        Ok(true)
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn consent_timeout(&self) -> Duration {
        Duration::from_millis(self.consent_timeout_ms)
    }

    fn normalize(&mut self) -> Result<()> {
        self.server_url = self.server_url.trim().to_string();
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            self.name = default_name();
        }
        self.room = self.room.trim().to_string();
        if self.room.is_empty() {
            self.room = default_room();
        }
        if self.peer_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            self.peer_id = Some(Uuid::new_v4().to_string());
            self.peer_id_minted = true;
        }
        if self.passphrase.as_deref() == Some("") {
            self.passphrase = None;
        }
        if self.download_dir.is_relative() {
            let base = match self.config_path.as_deref().and_then(Path::parent) {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => std::env::current_dir().context("current dir")?,
            };
            self.download_dir = base.join(&self.download_dir);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.server_url).context("server_url")?;
        validate_room(&self.room)?;
        if self.direct_timeout_ms == 0 || self.consent_timeout_ms == 0 {
            anyhow::bail!("timeouts must be positive");
        }
        self.direct_bind
            .parse::<SocketAddr>()
            .with_context(|| format!("direct_bind '{}'", self.direct_bind))?;
        Ok(())
    }

    pub fn peer_id(&self) -> &str {
        self.peer_id.as_deref().unwrap_or_default()
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" | "http" | "https" => Ok(()),
        _ => anyhow::bail!("url must be ws, wss, http or https"),
    }
}

pub fn validate_room(room: &str) -> Result<()> {
    let pattern = ROOM_PATTERN
        .as_ref()
        .map_err(|e| anyhow::anyhow!("room pattern: {e}"))?;
    if pattern.is_match(room) {
        Ok(())
    } else {
        anyhow::bail!("invalid room: {room}")
    }
}
