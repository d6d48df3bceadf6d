// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration stored in `~/.dlsync/config.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::{PacingConfig, SessionConfig};

const CONFIG_DIR: &str = ".dlsync";
const CONFIG_FILE: &str = "config.json";

/// Delay schedule for full reloads, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingSettings {
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            step_ms: default_step_ms(),
            max_ms: default_max_ms(),
        }
    }
}

impl From<&PacingSettings> for PacingConfig {
    fn from(settings: &PacingSettings) -> Self {
        PacingConfig {
            step: Duration::from_millis(settings.step_ms),
            max: Duration::from_millis(settings.max_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Queue file; defaults to `queue.json` in the config directory
    #[serde(default)]
    pub queue_path: Option<PathBuf>,
    /// Where new downloads are written; defaults to the user's download dir
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
    /// Scratch space for copy-fallback removals; defaults to the file's dir
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default)]
    pub pacing: PacingSettings,
    #[serde(default = "default_speed_window_secs")]
    pub speed_window_secs: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_step_ms() -> u64 {
    10
}

fn default_max_ms() -> u64 {
    100
}

fn default_speed_window_secs() -> u64 {
    10
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_path: None,
            downloads_dir: None,
            scratch_dir: None,
            pacing: PacingSettings::default(),
            speed_window_secs: default_speed_window_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// `~/.dlsync`, created if missing.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(CONFIG_DIR);
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

impl Config {
    /// Load from `path`, or the default location. A missing file is written
    /// out with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn queue_path(&self) -> Result<PathBuf> {
        match &self.queue_path {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("queue.json")),
        }
    }

    pub fn downloads_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.downloads_dir {
            return Ok(dir.clone());
        }
        match dirs::download_dir() {
            Some(dir) => Ok(dir),
            None => Ok(config_dir()?.join("downloads")),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Session tunables derived from this config.
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            pacing: PacingConfig::from(&self.pacing),
            speed_window: Duration::from_secs(self.speed_window_secs),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            scratch_dir: self.scratch_dir.clone(),
            scan_dirs: vec![self.downloads_dir()?],
        })
    }

    /// Tunables for a command that loads once and exits.
    ///
    /// Nobody watches the rows arrive, so they are applied without pauses.
    pub fn one_shot_session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            pacing: PacingConfig::immediate(),
            ..self.session_config()?
        })
    }
}
