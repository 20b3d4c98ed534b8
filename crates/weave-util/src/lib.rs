#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for weave.
//!
//! Pure helpers with no logging dependencies: content fingerprints and
//! crash-safe filesystem writes used by the build cache and artifact writer.

pub mod fs;
pub mod hash;
