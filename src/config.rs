//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;

/// Smallest (and default) dynamic heap budget in MiB.
pub const DEFAULT_HEAP_SIZE_MB: usize = 64;

/// Largest dynamic heap budget accepted from the environment, in MiB.
pub const MAX_HEAP_SIZE_MB: usize = 1024;

/// Environment variable overriding `heap_size_mb`.
pub const HEAP_SIZE_ENV: &str = "MIRE_HEAP_SIZE";

/// What a static-mode `call` does when its target name is not registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedCallPolicy {
    /// Discard the arguments silently
    Ignore,
    /// Discard the arguments and log a warning
    #[default]
    Warn,
    /// Abort with a fatal error
    Error,
}

/// Tracing switches checked inside the dispatch loops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Log every dispatched opcode at `trace` level
    pub opcodes: bool,
    /// Log every call boundary at `debug` level
    pub calls: bool,
}

/// Runtime configuration for both engines
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub unresolved_call: UnresolvedCallPolicy,
    pub trace: TraceConfig,
    /// Dynamic heap budget in MiB
    pub heap_size_mb: usize,
    /// Size of the dynamic-mode emulated stack in KiB
    pub stack_size_kb: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            unresolved_call: UnresolvedCallPolicy::Warn,
            trace: TraceConfig::default(),
            heap_size_mb: DEFAULT_HEAP_SIZE_MB,
            stack_size_kb: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml(&content)
    }

    /// Apply `MIRE_HEAP_SIZE` if it is set to a number.
    pub fn apply_env(&mut self) {
        if let Some(mb) = std::env::var(HEAP_SIZE_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.heap_size_mb = clamp_heap_size(mb);
        }
    }

    pub fn heap_size_bytes(&self) -> usize {
        self.heap_size_mb * 1024 * 1024
    }

    /// Number of 8-byte words in the dynamic stack.
    pub fn stack_words(&self) -> usize {
        (self.stack_size_kb * 1024 / 8).max(64)
    }
}

fn clamp_heap_size(mb: usize) -> usize {
    mb.clamp(DEFAULT_HEAP_SIZE_MB, MAX_HEAP_SIZE_MB)
}
