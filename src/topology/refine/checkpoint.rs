//! Persisting refinement levels and split history.
//!
//! The checkpoint is a versioned serde document, so any serde format works;
//! JSON helpers are provided. Loading validates the history back-links, and
//! a restored state reproduces the same unrefinement decisions as the state
//! that was saved.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshError;
use crate::topology::refine::levels::{RecordId, RefinementLevelState, SplitRecord};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Format version written by this crate.
pub const CHECKPOINT_VERSION: u32 = 1;

/// On-disk form of a [`RefinementLevelState`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelCheckpoint {
    pub version: u32,
    pub cell_level: Vec<u32>,
    pub point_level: Vec<u32>,
    pub history: Vec<Option<SplitRecord>>,
    pub cell_record: Vec<Option<RecordId>>,
}

impl RefinementLevelState {
    pub fn to_checkpoint(&self) -> LevelCheckpoint {
        LevelCheckpoint {
            version: CHECKPOINT_VERSION,
            cell_level: self.cell_level.clone(),
            point_level: self.point_level.clone(),
            history: self.history.clone(),
            cell_record: self.cell_record.clone(),
        }
    }

    /// Rebuild from a checkpoint.
    ///
    /// # Errors
    /// [`MeshError::Checkpoint`] for another version or a document whose
    /// history does not link up.
    pub fn from_checkpoint(ckpt: LevelCheckpoint) -> Result<Self, MeshError> {
        if ckpt.version != CHECKPOINT_VERSION {
            return Err(MeshError::Checkpoint(format!(
                "checkpoint version {} (this build reads {CHECKPOINT_VERSION})",
                ckpt.version
            )));
        }
        let state = RefinementLevelState {
            cell_level: ckpt.cell_level,
            point_level: ckpt.point_level,
            history: ckpt.history,
            cell_record: ckpt.cell_record,
        };
        state
            .validate_invariants()
            .map_err(|e| MeshError::Checkpoint(format!("inconsistent checkpoint: {e}")))?;
        Ok(state)
    }
}

pub fn to_json_string(state: &RefinementLevelState) -> Result<String, MeshError> {
    Ok(serde_json::to_string(&state.to_checkpoint())?)
}

pub fn from_json_str(text: &str) -> Result<RefinementLevelState, MeshError> {
    RefinementLevelState::from_checkpoint(serde_json::from_str(text)?)
}

pub fn write_json<W: Write>(state: &RefinementLevelState, writer: W) -> Result<(), MeshError> {
    serde_json::to_writer(writer, &state.to_checkpoint())?;
    Ok(())
}

pub fn read_json<R: Read>(reader: R) -> Result<RefinementLevelState, MeshError> {
    RefinementLevelState::from_checkpoint(serde_json::from_reader(reader)?)
}
