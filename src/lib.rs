//! Strata - content-addressed layer cache for staged image builds
//!
//! Every build step is fingerprinted from its kind, its resolved inputs
//! and the fingerprint of the layer below it. A step whose fingerprint is
//! already cached is reused; the first changed step and everything after
//! it in the stage are rebuilt.

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod hash;
pub mod history;
pub mod ui;

pub use error::{StrataError, StrataResult};
