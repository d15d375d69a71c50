// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Agent settings and the JSON file that stores them.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::types::PrinterConfig;

/// Name of the settings file, both in the working directory and the
/// per-user config directory.
pub const SETTINGS_FILE: &str = "config.json";

/// Per-user config subdirectory.
const APP_DIR: &str = "ticketrelay";

/// Persistent agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Base address of the job-issuing server (`https://…` or `wss://…`).
    pub server_url: String,
    pub restaurant_id: String,
    pub api_key: String,
    /// Unreadable entries are skipped at load time.
    #[serde(deserialize_with = "crate::types::deserialize_printer_list")]
    pub printers: Vec<PrinterConfig>,
    /// Reconnect delay unit; attempt `n` waits `n` times this.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            restaurant_id: String::new(),
            api_key: String::new(),
            printers: Vec::new(),
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl AgentSettings {
    /// Fail with `ConfigIncomplete` unless the server credentials are set.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.server_url.trim().is_empty() {
            missing.push("serverUrl");
        }
        if self.restaurant_id.trim().is_empty() {
            missing.push("restaurantId");
        }
        if self.api_key.trim().is_empty() {
            missing.push("apiKey");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RelayError::ConfigIncomplete(missing))
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Where settings come from and go to.
///
/// `update_settings` merges the given top-level fields into what is stored;
/// `update_printers` replaces the printer list wholesale.
pub trait SettingsProvider: Send + Sync {
    fn get_settings(&self) -> Result<AgentSettings>;
    fn update_settings(&self, patch: Value) -> Result<AgentSettings>;
    fn update_printers(&self, printers: &[PrinterConfig]) -> Result<AgentSettings>;
}

/// Settings stored as pretty-printed JSON on disk.
pub struct JsonFileSettings {
    path: PathBuf,
    // Serializes read-modify-write cycles from concurrent updates.
    lock: Mutex<()>,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Use `./config.json` when present, otherwise the per-user config dir.
    pub fn discover() -> Self {
        Self::new(default_settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_value(&self) -> Result<Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Value::Object(Default::default())),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no settings file yet, using defaults");
                Ok(Value::Object(Default::default()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_value(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(value)?;
        std::fs::write(&self.path, text)?;
        info!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    fn modify(&self, change: impl FnOnce(&mut serde_json::Map<String, Value>)) -> Result<AgentSettings> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| RelayError::Settings("settings lock poisoned".into()))?;

        let mut value = self.read_value()?;
        let Value::Object(map) = &mut value else {
            return Err(RelayError::Settings(format!(
                "{} does not contain a JSON object",
                self.path.display()
            )));
        };
        change(map);

        let settings: AgentSettings = serde_json::from_value(value.clone())
            .map_err(|e| RelayError::Settings(format!("rejected settings update: {e}")))?;
        self.write_value(&value)?;
        Ok(settings)
    }
}

impl SettingsProvider for JsonFileSettings {
    fn get_settings(&self) -> Result<AgentSettings> {
        let value = self.read_value()?;
        serde_json::from_value(value)
            .map_err(|e| RelayError::Settings(format!("{}: {e}", self.path.display())))
    }

    fn update_settings(&self, patch: Value) -> Result<AgentSettings> {
        let Value::Object(fields) = patch else {
            return Err(RelayError::Settings("settings patch must be a JSON object".into()));
        };
        self.modify(move |map| map.extend(fields))
    }

    fn update_printers(&self, printers: &[PrinterConfig]) -> Result<AgentSettings> {
        let printers = serde_json::to_value(printers)?;
        self.modify(move |map| {
            map.insert("printers".into(), printers);
        })
    }
}

/// Resolve the settings file location.
pub fn default_settings_path() -> PathBuf {
    let local = PathBuf::from(SETTINGS_FILE);
    if local.is_file() {
        return local;
    }
    config_dir_fallback().join(APP_DIR).join(SETTINGS_FILE)
}

fn config_dir_fallback() -> PathBuf {
    if cfg!(windows)
        && let Ok(appdata) = std::env::var("APPDATA")
    {
        return PathBuf::from(appdata);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        if cfg!(target_os = "macos") {
            return home.join("Library").join("Application Support");
        }
        return home.join(".config");
    }
    PathBuf::from(".")
}
