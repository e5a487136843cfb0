//! FASTLANE: DEX trade execution core
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod events;
pub mod chain;
pub mod risk;
pub mod nonce;
pub mod gas;
pub mod storage;
pub mod breaker;
pub mod engine;
