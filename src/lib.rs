//! Wallet Engine - transaction lifecycle for unattended multi-chain payment bots
//!
//! Bots enqueue payments; one monitor per chain, elected through a database
//! lease, prepares, signs, broadcasts, replaces and finalizes them.

pub mod chain;
pub mod config;
pub mod error;
pub mod fee;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod state;
pub mod wallet;
