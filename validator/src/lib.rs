pub use crate::{
    dispatcher::DutyDispatcher,
    doppelganger::DoppelgangerProtection,
    messages::ValidatorToP2p,
    signer::{NullSigner, Signer, SigningMessage},
};

mod dispatcher;
mod doppelganger;
mod messages;
mod signer;
