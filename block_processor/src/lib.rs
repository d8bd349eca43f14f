pub use crate::{
    controller::{Controller, ProcessorHandle},
    messages::P2pMessage,
    misc::{BlockOrigin, VerifierError},
    state_transition::{StateTransition, TransitionOutcome, TrivialStateTransition},
};

mod controller;
mod messages;
mod misc;
mod mutator;
mod state_transition;

#[cfg(test)]
mod tests;
