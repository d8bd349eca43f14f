//! Interface to the execution layer client.
//!
//! The JSON-RPC transport, JWT authentication and payload building live in an
//! external crate. The consensus side only needs the two notifications below
//! and their tri-state outcome.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use types::primitives::ExecutionBlockHash;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadStatus {
    Valid,
    Invalid,
    Syncing,
}

impl PayloadStatus {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    #[must_use]
    pub const fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }
}

pub trait ExecutionEngine: Send + Sync {
    /// `engine_newPayload`: submit an execution payload for validation.
    fn notify_new_payload(&self, block_hash: ExecutionBlockHash) -> Result<PayloadStatus>;

    /// `engine_forkchoiceUpdated`: move the execution head and finalized block.
    fn notify_forkchoice_updated(
        &self,
        head_block_hash: ExecutionBlockHash,
        finalized_block_hash: ExecutionBlockHash,
    ) -> Result<PayloadStatus>;
}

/// Stands in for an execution engine before the merge and in tests.
/// Everything is optimistically valid.
#[derive(Clone, Copy, Default)]
pub struct NullExecutionEngine;

impl ExecutionEngine for NullExecutionEngine {
    fn notify_new_payload(&self, _block_hash: ExecutionBlockHash) -> Result<PayloadStatus> {
        Ok(PayloadStatus::Valid)
    }

    fn notify_forkchoice_updated(
        &self,
        _head_block_hash: ExecutionBlockHash,
        _finalized_block_hash: ExecutionBlockHash,
    ) -> Result<PayloadStatus> {
        Ok(PayloadStatus::Valid)
    }
}
