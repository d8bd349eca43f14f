use core::time::Duration;

use cached::{Cached as _, TimedSizedCache};
use log::debug;
use types::{containers::BlobIdentifier, primitives::H256};

use crate::misc::RequestId;

const MAX_REQUESTS_PER_KEY: usize = 3;
const REQUEST_BY_ROOT_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_SIZE: usize = 1000;

/// Issues targeted by-root block and blob requests for quarantined objects.
///
/// Suspended while range sync is in progress, since the missing objects are
/// going to arrive through range requests anyway. Requests are deduplicated
/// per key with a bounded number of peers asked concurrently.
pub struct RequestManager {
    block_requests: TimedSizedCache<H256, usize>,
    blob_requests: TimedSizedCache<BlobIdentifier, usize>,
    next_request_id: RequestId,
}

impl RequestManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_requests: TimedSizedCache::with_size_and_lifespan(
                CACHE_SIZE,
                REQUEST_BY_ROOT_TIMEOUT.as_secs(),
            ),
            blob_requests: TimedSizedCache::with_size_and_lifespan(
                CACHE_SIZE,
                REQUEST_BY_ROOT_TIMEOUT.as_secs(),
            ),
            next_request_id: usize::MAX / 2,
        }
    }

    /// Whether a block with this root may be requested now. Records the
    /// attempt when it may.
    pub fn ready_to_request_block(&mut self, block_root: H256) -> bool {
        let attempts = self.block_requests.cache_get_or_set_with(block_root, || 0);

        if *attempts >= MAX_REQUESTS_PER_KEY {
            debug!("not requesting block {block_root:?} again; too many attempts in flight");
            return false;
        }

        *attempts += 1;
        true
    }

    pub fn ready_to_request_blobs(&mut self, identifiers: &[BlobIdentifier]) -> Vec<BlobIdentifier> {
        identifiers
            .iter()
            .filter(|identifier| {
                let attempts = self.blob_requests.cache_get_or_set_with(**identifier, || 0);

                if *attempts >= MAX_REQUESTS_PER_KEY {
                    return false;
                }

                *attempts += 1;
                true
            })
            .copied()
            .collect()
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        request_id
    }

    /// Clears the attempt counter for a key that was answered.
    pub fn block_received(&mut self, block_root: H256) {
        self.block_requests.cache_remove(&block_root);
    }

    pub fn blob_received(&mut self, identifier: BlobIdentifier) {
        self.blob_requests.cache_remove(&identifier);
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_block_requests_are_limited_per_key() {
        let mut manager = RequestManager::new();
        let root = H256::repeat_byte(1);

        for _ in 0..MAX_REQUESTS_PER_KEY {
            assert!(manager.ready_to_request_block(root));
        }

        assert!(!manager.ready_to_request_block(root));

        // A response clears the limit.
        manager.block_received(root);
        assert!(manager.ready_to_request_block(root));
    }

    #[test]
    fn blob_requests_filter_out_exhausted_identifiers() {
        let mut manager = RequestManager::new();

        let exhausted = BlobIdentifier {
            block_root: H256::repeat_byte(1),
            index: 0,
        };
        let fresh = BlobIdentifier {
            block_root: H256::repeat_byte(1),
            index: 1,
        };

        for _ in 0..MAX_REQUESTS_PER_KEY {
            assert!(!manager.ready_to_request_blobs(&[exhausted]).is_empty());
        }

        assert_eq!(manager.ready_to_request_blobs(&[exhausted, fresh]), [fresh]);
    }
}
