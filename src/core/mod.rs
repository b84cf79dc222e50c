//! Core deterministic primitives.
//!
//! Seeded randomness used by the bot decision engine. Deterministic so that
//! win-rate simulations produce identical results across test runs.

pub mod rng;

pub use rng::DeterministicRng;
