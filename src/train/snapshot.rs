//! Disk checkpoints: adapter + optimizer + training state, composer-keyed.
//!
//! The payload is versioned JSON wrapped with a SHA-256 digest; loading
//! verifies both, so a truncated or hand-edited file is rejected instead of
//! silently resuming a corrupt run. Serialized floats round-trip exactly, so
//! save→load reproduces an identical continuation.

use crate::adapter::AdapterState;
use crate::autograd::ScalerState;
use crate::data::sequence::Composer;
use crate::error::{Error, Result};
use crate::optim::OptimizerState;
use crate::train::state::TrainingState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

const SNAPSHOT_FORMAT_VERSION: &str = "1.0";

/// Everything needed to resume a run at an accumulation boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    version: String,
    pub composer: Composer,
    pub saved_at: chrono::DateTime<chrono::Utc>,
    pub adapter: AdapterState,
    pub optimizer: OptimizerState,
    pub training: TrainingState,
    pub scaler: ScalerState,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    digest: String,
    snapshot: Snapshot,
}

impl Snapshot {
    /// Assemble a snapshot. Callers must be at an accumulation boundary.
    pub fn new(
        composer: Composer,
        adapter: AdapterState,
        optimizer: OptimizerState,
        training: TrainingState,
        scaler: ScalerState,
    ) -> Self {
        debug_assert!(
            training.at_boundary(),
            "snapshots must be taken at accumulation boundaries"
        );
        Self {
            version: SNAPSHOT_FORMAT_VERSION.to_string(),
            composer,
            saved_at: chrono::Utc::now(),
            adapter,
            optimizer,
            training,
            scaler,
        }
    }

    /// Write to disk with an integrity digest.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let payload = serde_json::to_vec(self)?;
        let digest = hex_digest(&payload);
        let file = File::create(path)?;
        serde_json::to_writer(
            BufWriter::new(file),
            &SnapshotFile {
                digest,
                snapshot: self.clone(),
            },
        )?;
        Ok(())
    }

    /// Read from disk, verifying digest and format version.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let wrapper: SnapshotFile = serde_json::from_reader(BufReader::new(file))?;
        let payload = serde_json::to_vec(&wrapper.snapshot)?;
        let digest = hex_digest(&payload);
        if digest != wrapper.digest {
            return Err(Error::SnapshotIntegrity(format!(
                "digest mismatch: file says {}, payload hashes to {digest}",
                wrapper.digest
            )));
        }
        if wrapper.snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::SnapshotIntegrity(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_FORMAT_VERSION})",
                wrapper.snapshot.version
            )));
        }
        Ok(wrapper.snapshot)
    }
}

/// Canonical snapshot filename under `dir`, keyed by composer and step.
pub fn snapshot_path(dir: &Path, composer: Composer, step: u64) -> PathBuf {
    dir.join(format!("{composer}-step{step:06}.json"))
}

fn hex_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}
