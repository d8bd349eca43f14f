use std::sync::atomic::{AtomicU8, Ordering};

/// Process-wide lifecycle state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum NodeStatus {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl NodeStatus {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Atomic holder of the node status. Signal handlers only ever perform the
/// `Running -> Stopping` transition through `compare_exchange`, so a handler
/// firing during startup or shutdown never clobbers the state.
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self(AtomicU8::new(NodeStatus::Starting as u8))
    }
}

impl StatusCell {
    #[must_use]
    pub fn get(&self) -> NodeStatus {
        NodeStatus::from_raw(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: NodeStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Transitions from `expected` to `new`. Returns whether the transition
    /// happened.
    pub fn transition(&self, expected: NodeStatus, new: NodeStatus) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.get() == NodeStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_expected_transition_succeeds() {
        let status = StatusCell::default();

        assert!(!status.transition(NodeStatus::Running, NodeStatus::Stopping));
        assert_eq!(status.get(), NodeStatus::Starting);

        status.set(NodeStatus::Running);

        assert!(status.transition(NodeStatus::Running, NodeStatus::Stopping));
        assert!(!status.transition(NodeStatus::Running, NodeStatus::Stopping));
        assert_eq!(status.get(), NodeStatus::Stopping);
    }
}
