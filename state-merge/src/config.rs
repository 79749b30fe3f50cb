//! Stream configuration.
//!
//! Configuration is injected through constructors; nothing reaches upward
//! for it. A [`StreamSpec`] names one stream family (domain, history, and
//! inverted index share a base name) and fixes its clock geometry, and the
//! per-kind option structs select the secondary structures built next to
//! each data file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::files;

/// Identity and clock geometry of one stream family.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Base name appearing in file names (`v1-<name>.<from>-<to>.<ext>`).
    pub name: String,
    /// Directory holding the stream's files.
    pub dir: PathBuf,
    /// Number of tx numbers per step. All file bounds are multiples of it.
    pub step: u64,
    /// Span, in steps, at which a merged file freezes. Frozen files have
    /// reached the maximum merge tier and are never merged or collected.
    pub frozen_steps: u64,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, step: u64, frozen_steps: u64) -> Self {
        assert!(step > 0, "aggregation step must be positive");
        assert!(frozen_steps.is_power_of_two(), "frozen span must be a power of two: {frozen_steps}");
        Self { name: name.into(), dir: dir.into(), step, frozen_steps }
    }

    /// Path of this stream's file covering steps `[from_step, to_step)`.
    pub fn file_path(&self, from_step: u64, to_step: u64, ext: &str) -> PathBuf {
        self.dir.join(files::file_name(&self.name, from_step, to_step, ext))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Span cap in tx numbers implied by the frozen tier.
    pub fn frozen_span(&self) -> u64 {
        self.frozen_steps * self.step
    }
}

/// Which index structure a domain builds over its values files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessorKind {
    /// Salted-hash accessor (`.kvi`), point lookups only.
    Hash,
    /// Sampled sorted-key index (`.bt`) with an embedded key cursor.
    Sampled,
}

/// Secondary-structure options for a domain's values files.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DomainOpts {
    pub accessor: AccessorKind,
    /// Build a `.kvei` existence filter next to each values file.
    pub existence_filter: bool,
}

impl Default for DomainOpts {
    fn default() -> Self {
        Self { accessor: AccessorKind::Hash, existence_filter: false }
    }
}

/// Secondary-structure options for an inverted-index stream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct IndexOpts {
    /// Build a `.efei` existence filter next to each index file.
    pub existence_filter: bool,
}
