//! Startup configuration for hosted builds.
//!
//! ```toml
//! root_arena_size = 4194304
//! game_heap_size = 241664
//! fit_policy = "best_fit"
//! zero_fill = false
//!
//! [[heaps]]
//! name = "sound"
//! kind = "expanding"
//! size = 1048576
//!
//! [[heaps]]
//! name = "level"
//! kind = "solid"
//! size = 65536
//! alignment = -32
//! parent = "game"
//! ```

use std::collections::HashSet;

use serde::Deserialize;

use crate::{
    alignment::{Alignment, DEFAULT_ALIGNMENT},
    error::ConfigError,
    expanding::FitPolicy,
    record::{HeapFlags, HeapKind},
};

/// Name under which the root heap can be used as a parent.
pub const ROOT_HEAP_NAME: &str = "root";

/// Name under which the game heap can be used as a parent.
pub const GAME_HEAP_NAME: &str = "game";

/// Root arena size used when the configuration doesn't set one.
pub const DEFAULT_ROOT_ARENA_SIZE: usize = 0x40_0000;

/// Game heap size used when the configuration doesn't set one.
pub const DEFAULT_GAME_HEAP_SIZE: usize = 0x3_B000;

/// Everything [`crate::MemoryContext::from_config`] needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Bytes mapped for the root heap.
    pub root_arena_size: usize,
    /// Size of the game heap carved out of the root. 0 skips it.
    pub game_heap_size: usize,
    /// Fit policy of the root heap, inherited by expanding children.
    pub fit_policy: FitPolicy,
    /// Zero released payloads in every configured heap.
    pub zero_fill: bool,
    /// Stop the process when any configured heap runs out of memory.
    pub abort_on_exhaustion: bool,
    /// Named nested heaps, created in declaration order.
    pub heaps: Vec<HeapConfig>,
}

/// One named nested heap.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeapConfig {
    pub name: String,
    pub kind: HeapKind,
    /// Usable bytes, heap headers not included.
    pub size: usize,
    /// Signed alignment of the carve-out in the parent.
    #[serde(default = "default_alignment")]
    pub alignment: i32,
    /// Name of a previously declared heap, [`ROOT_HEAP_NAME`] or
    /// [`GAME_HEAP_NAME`]. Defaults to the root heap.
    #[serde(default)]
    pub parent: Option<String>,
}

fn default_alignment() -> i32 {
    DEFAULT_ALIGNMENT
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            root_arena_size: DEFAULT_ROOT_ARENA_SIZE,
            game_heap_size: DEFAULT_GAME_HEAP_SIZE,
            fit_policy: FitPolicy::default(),
            zero_fill: false,
            abort_on_exhaustion: false,
            heaps: Vec::new(),
        }
    }
}

impl MemoryConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Flags given to every heap built from this configuration.
    pub fn flags(&self) -> HeapFlags {
        let mut flags = HeapFlags::empty();
        flags.set(HeapFlags::ZERO_FILL, self.zero_fill);
        flags.set(HeapFlags::ABORT_ON_EXHAUSTION, self.abort_on_exhaustion);
        flags
    }

    /// Catches layouts that can never be built: unknown or forward parent
    /// references, duplicate or reserved names, bad alignments, and sizes
    /// that can't fit in the root arena.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_arena_size == 0 {
            return Err(ConfigError::Invalid("root_arena_size must not be 0".into()));
        }

        let mut known = HashSet::from([ROOT_HEAP_NAME]);
        if self.game_heap_size > 0 {
            known.insert(GAME_HEAP_NAME);
        }

        let mut requested = self.game_heap_size;

        for heap in &self.heaps {
            if heap.name.is_empty() {
                return Err(ConfigError::Invalid("heap names must not be empty".into()));
            }
            if heap.name == ROOT_HEAP_NAME || heap.name == GAME_HEAP_NAME || !known.insert(heap.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate heap name `{}`", heap.name)));
            }
            if heap.size == 0 {
                return Err(ConfigError::Invalid(format!("heap `{}` has size 0", heap.name)));
            }
            if Alignment::from_signed(heap.alignment).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "heap `{}` has invalid alignment {}",
                    heap.name, heap.alignment
                )));
            }
            if let Some(parent) = &heap.parent {
                if parent == &heap.name || !known.contains(parent.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "heap `{}` names unknown parent `{parent}`",
                        heap.name
                    )));
                }
            }

            requested = requested.saturating_add(heap.size);
        }

        if requested >= self.root_arena_size {
            return Err(ConfigError::Invalid(format!(
                "heaps request {requested} bytes but the root arena has {}",
                self.root_arena_size
            )));
        }

        Ok(())
    }
}
