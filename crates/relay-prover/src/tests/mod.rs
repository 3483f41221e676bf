mod pipeline;
mod queue;

use std::sync::Arc;

use relay_types::{ChainId, Update};
use storage::jobs::testing::MockJobStore;
use storage::proofs::testing::MockProofStore;

use crate::config::Config;
use crate::pipeline::RelayContext;
use crate::queue::{EventMonitor, QueueConfig};
use crate::server::open_context;

pub(crate) const CHAIN: ChainId = ChainId {
    merkle_tree_index: 0,
    format_version: 1,
};

pub(crate) fn test_queue_config(max_attempts: u32) -> QueueConfig {
    QueueConfig {
        visibility_timeout_secs: 60,
        max_attempts,
        backoff_base_ms: 10,
        backoff_max_ms: 40,
    }
}

pub(crate) fn test_context(max_attempts: u32) -> (RelayContext, Arc<MockProofStore>) {
    let config = Config {
        chain: CHAIN,
        queue: test_queue_config(max_attempts),
        ..Config::default()
    };
    let store = Arc::new(MockProofStore::new());
    let ctx = open_context(&config, store.clone(), Arc::new(MockJobStore::new()), EventMonitor::new(64)).unwrap();
    (ctx, store)
}

/// Builds the updates of a contiguous chain starting with a genesis update at `start`.
pub(crate) fn chain_updates(start: u64, len: u64) -> Vec<Update> {
    (start..start + len)
        .map(|slot| {
            let payload = format!("{{\"slot\":{slot}}}").into_bytes();
            if slot == start {
                Update::genesis(slot, payload)
            } else {
                Update::new(slot, slot - 1, payload)
            }
        })
        .collect()
}
