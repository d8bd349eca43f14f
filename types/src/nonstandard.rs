use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Consensus fork a block or state belongs to.
///
/// The order of variants affects the derived `PartialOrd` and `Ord` impls.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Sequence,
    AsRefStr,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
}

impl Phase {
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Sequence::next(&self)
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self::Phase0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValidationOutcome {
    Accept,
    Ignore,
}
