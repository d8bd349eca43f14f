pub mod altair;
pub mod beacon_state;
pub mod bellatrix;
pub mod capella;
pub mod combined;
pub mod config;
pub mod consts;
pub mod containers;
pub mod deneb;
pub mod misc;
pub mod nonstandard;
pub mod phase0;
pub mod primitives;
