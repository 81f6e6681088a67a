//! Engine configuration.
//!
//! Each acquisition session is described by one [`EngineConfig`], loaded from
//! JSON or built in code and handed to the engine at construction.

use crate::error::{Error, Result};
use crate::paging::PagingMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest synthetic memory backend a configuration may ask for (16 GiB).
pub const MAX_MEMORY_SIZE: u64 = 1 << 34;

fn parse_u64_value<E: serde::de::Error>(value: serde_json::Value) -> std::result::Result<u64, E> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| E::custom("expected unsigned 64-bit integer")),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).map_err(E::custom)
            } else {
                s.parse::<u64>().map_err(E::custom)
            }
        }
        _ => Err(E::custom("expected number or hex string")),
    }
}

/// Deserialize a u64 that accepts decimal numbers, hex strings ("0x1ad000"),
/// or plain decimal strings ("1234").
fn deserialize_u64_hex<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    parse_u64_value(serde_json::Value::deserialize(deserializer)?)
}

fn deserialize_optional_u64_hex<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let val: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match val {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => parse_u64_value(value).map(Some),
    }
}

/// Where physical memory comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSpec {
    /// Raw physical memory dump. `file://` URLs are accepted.
    File {
        path: String,
        #[serde(default)]
        writable: bool,
    },
    /// Zero-filled in-memory image.
    Memory {
        #[serde(deserialize_with = "deserialize_u64_hex")]
        size: u64,
        #[serde(default)]
        read_only: bool,
    },
    /// Live acquisition device, opened through an injected connector.
    Device { identifier: String },
}

/// An address space to register when the engine opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub pid: u32,
    /// Paging root. Accepts decimal or hex ("0x1ad000").
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub dtb: u64,
    /// Optional user-mode paging root.
    #[serde(default, deserialize_with = "deserialize_optional_u64_hex")]
    pub dtb_user: Option<u64>,
}

fn default_cache_frames() -> usize {
    4096
}

fn default_cache_shards() -> usize {
    16
}

fn default_translation_cache() -> usize {
    4096
}

fn default_max_concurrency() -> usize {
    4
}

fn default_translation_retries() -> u32 {
    1
}

/// Configuration for one acquisition session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub backend: BackendSpec,
    #[serde(default)]
    pub paging_mode: PagingMode,
    /// Page cache bound in frames. Zero disables caching.
    #[serde(default = "default_cache_frames")]
    pub cache_frames: usize,
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,
    /// Translation cache bound in pages. Zero disables it.
    #[serde(default = "default_translation_cache")]
    pub translation_cache: usize,
    /// Bound on concurrent backend operations within one batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Extra walks allowed after a paging structure read fails.
    #[serde(default = "default_translation_retries")]
    pub translation_retries: u32,
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
}

impl EngineConfig {
    /// Defaults for the given backend.
    pub fn new(backend: BackendSpec) -> Self {
        EngineConfig {
            backend,
            paging_mode: PagingMode::default(),
            cache_frames: default_cache_frames(),
            cache_shards: default_cache_shards(),
            translation_cache: default_translation_cache(),
            max_concurrency: default_max_concurrency(),
            translation_retries: default_translation_retries(),
            processes: Vec::new(),
        }
    }

    /// Configuration for a raw dump file.
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(BackendSpec::File {
            path: path.into(),
            writable: false,
        })
    }

    /// Configuration for a zero-filled in-memory image.
    pub fn memory(size: u64) -> Self {
        Self::new(BackendSpec::Memory {
            size,
            read_only: false,
        })
    }

    pub fn with_paging_mode(mut self, mode: PagingMode) -> Self {
        self.paging_mode = mode;
        self
    }

    pub fn with_cache_frames(mut self, frames: usize) -> Self {
        self.cache_frames = frames;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_translation_retries(mut self, retries: u32) -> Self {
        self.translation_retries = retries;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be > 0".into()));
        }
        if self.cache_frames > 0 && self.cache_shards == 0 {
            return Err(Error::Config("cache_shards must be > 0".into()));
        }
        match &self.backend {
            BackendSpec::File { path, .. } if path.trim().is_empty() => {
                return Err(Error::Config("backend path is empty".into()));
            }
            BackendSpec::Memory { size: 0, .. } => {
                return Err(Error::Config("memory backend size must be > 0".into()));
            }
            BackendSpec::Memory { size, .. }
                if *size > MAX_MEMORY_SIZE || usize::try_from(*size).is_err() =>
            {
                return Err(Error::Config(format!(
                    "memory backend size {:#x} exceeds the limit of {:#x} bytes",
                    size,
                    MAX_MEMORY_SIZE.min(usize::MAX as u64)
                )));
            }
            BackendSpec::Device { identifier } if identifier.trim().is_empty() => {
                return Err(Error::Config("device identifier is empty".into()));
            }
            _ => {}
        }

        let mut pids: Vec<u32> = self.processes.iter().map(|p| p.pid).collect();
        pids.sort_unstable();
        if let Some(dup) = pids.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Config(format!("process {} listed twice", dup[0])));
        }
        Ok(())
    }
}
