// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<GneissConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dispatch_threads() -> usize {
    8
}

fn default_cancel_threads() -> usize {
    4
}

fn default_progress_log_period() -> i64 {
    100
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static GneissConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = GneissConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static GneissConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = GneissConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static GneissConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("GNEISS_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("gneiss.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $GNEISS_CONFIG or create ./gneiss.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct GneissConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "gneiss=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl GneissConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: GneissConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}

impl Default for GneissConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CoordinatorConfig {
    /// Upper bound on the number of worker threads used to issue
    /// start-fragment RPCs in parallel during Exec.
    #[serde(default = "default_dispatch_threads")]
    pub dispatch_threads: usize,

    /// Size of the background pool used to fire cancel RPCs.
    #[serde(default = "default_cancel_threads")]
    pub cancel_threads: usize,

    /// Emit a progress log line every this many completed scan ranges.
    #[serde(default = "default_progress_log_period")]
    pub progress_log_period: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_threads: default_dispatch_threads(),
            cancel_threads: default_cancel_threads(),
            progress_log_period: default_progress_log_period(),
        }
    }
}

/// Number of dispatch worker threads, falling back to the default when no
/// config file is present.
pub fn dispatch_threads() -> usize {
    config()
        .ok()
        .map(|c| c.coordinator.dispatch_threads)
        .unwrap_or_else(default_dispatch_threads)
        .max(1)
}

pub fn cancel_threads() -> usize {
    config()
        .ok()
        .map(|c| c.coordinator.cancel_threads)
        .unwrap_or_else(default_cancel_threads)
        .max(1)
}

pub fn progress_log_period() -> i64 {
    config()
        .ok()
        .map(|c| c.coordinator.progress_log_period)
        .unwrap_or_else(default_progress_log_period)
        .max(1)
}
