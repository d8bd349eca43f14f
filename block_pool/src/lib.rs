pub use crate::{
    blob_quarantine::{BlobFetchRecord, BlobQuarantine},
    block_quarantine::{BlockQuarantine, QuarantineRejection},
};

mod blob_quarantine;
mod block_quarantine;
