use std::collections::HashMap;

use log::{error, info, warn};
use types::primitives::{Epoch, ValidatorIndex};

/// How many epochs a validator listens for another instance signing with its
/// keys before its own signing is enabled.
const DOPPELGANGER_CHECK_DURATION_IN_EPOCHS: Epoch = 2;

#[derive(Clone, Copy)]
struct TrackedValidator {
    broadcast_start_epoch: Epoch,
    last_checked: Epoch,
}

/// Safety window before activating signing.
///
/// Armed when sync completes and disarmed while disconnected: liveness can
/// only be observed with gossip flowing. A validator is deemed safe after a
/// full check window with gossip active and no foreign message seen.
#[derive(Default)]
pub struct DoppelgangerProtection {
    tracked: HashMap<ValidatorIndex, TrackedValidator>,
    active: HashMap<ValidatorIndex, ()>,
    armed: bool,
}

impl DoppelgangerProtection {
    /// Starts the observation window for validators not yet cleared.
    pub fn arm(
        &mut self,
        validator_indices: impl IntoIterator<Item = ValidatorIndex>,
        current_epoch: Epoch,
    ) {
        self.armed = true;

        for validator_index in validator_indices {
            if self.active.contains_key(&validator_index) {
                continue;
            }

            self.tracked
                .entry(validator_index)
                .or_insert(TrackedValidator {
                    broadcast_start_epoch: current_epoch,
                    last_checked: current_epoch,
                });
        }

        if !self.tracked.is_empty() {
            info!(
                "doppelganger detection armed for {} validator(s)",
                self.tracked.len(),
            );
        }
    }

    /// Called when the node loses sync or its peers. Observation windows
    /// restart on the next `arm`.
    pub fn disarm(&mut self) {
        if self.armed {
            warn!("doppelganger detection disarmed; observation restarts after the next sync");
        }

        self.armed = false;
        self.tracked.clear();
    }

    /// Marks the passage of an epoch with gossip active and activates
    /// validators whose window has elapsed.
    pub fn on_epoch(&mut self, current_epoch: Epoch) {
        if !self.armed {
            return;
        }

        let (cleared, still_tracked) = self
            .tracked
            .drain()
            .partition::<HashMap<_, _>, _>(|(_, tracked)| {
                tracked.broadcast_start_epoch + DOPPELGANGER_CHECK_DURATION_IN_EPOCHS
                    <= current_epoch
            });

        self.tracked = still_tracked;

        for tracked in self.tracked.values_mut() {
            tracked.last_checked = current_epoch;
        }

        if !cleared.is_empty() {
            info!(
                "doppelganger detection cleared {} validator(s) at epoch {current_epoch}",
                cleared.len(),
            );
        }

        self.active
            .extend(cleared.into_keys().map(|validator_index| (validator_index, ())));
    }

    /// Reports a gossip message signed by one of our validator keys that this
    /// node did not produce. Returns true if the validator was still under
    /// observation, in which case the caller must initiate shutdown.
    pub fn on_foreign_message(&mut self, validator_index: ValidatorIndex) -> bool {
        if self.armed && self.tracked.contains_key(&validator_index) {
            error!(
                "doppelganger detected for validator {validator_index}; \
                 another instance is signing with the same keys",
            );

            return true;
        }

        false
    }

    /// Whether the validator may sign.
    #[must_use]
    pub fn allows_signing(&self, validator_index: ValidatorIndex) -> bool {
        if !self.armed {
            // Signing before the first arm would defeat the protection.
            return self.active.contains_key(&validator_index);
        }

        !self.tracked.contains_key(&validator_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validators_sign_only_after_the_observation_window_elapses() {
        let mut protection = DoppelgangerProtection::default();

        protection.arm([1, 2], 10);

        assert!(!protection.allows_signing(1));

        protection.on_epoch(11);
        assert!(!protection.allows_signing(1));

        protection.on_epoch(12);
        assert!(protection.allows_signing(1));
        assert!(protection.allows_signing(2));
    }

    #[test]
    fn disarming_restarts_the_observation_window() {
        let mut protection = DoppelgangerProtection::default();

        protection.arm([1], 10);
        protection.on_epoch(11);

        protection.disarm();
        assert!(!protection.allows_signing(1));

        protection.arm([1], 20);
        protection.on_epoch(21);
        assert!(!protection.allows_signing(1));

        protection.on_epoch(22);
        assert!(protection.allows_signing(1));
    }

    #[test]
    fn foreign_messages_during_observation_are_detected() {
        let mut protection = DoppelgangerProtection::default();

        protection.arm([1], 10);

        assert!(protection.on_foreign_message(1));

        protection.on_epoch(12);

        // After activation, own gossip echoes are expected.
        assert!(!protection.on_foreign_message(1));
    }

    #[test]
    fn cleared_validators_stay_active_across_rearms() {
        let mut protection = DoppelgangerProtection::default();

        protection.arm([1], 10);
        protection.on_epoch(12);

        protection.disarm();
        protection.arm([1], 20);

        assert!(protection.allows_signing(1));
    }
}
