//! KRW spot scalping engine for Upbit.
//!
//! Scans a fixed list of KRW markets for momentum entries, manages open
//! positions against take-profit, stop-loss and time exits, and keeps every
//! exchange call behind a priority rate limiter and per-service circuit
//! breakers.

pub mod api;
pub mod db;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod resilience;
pub mod session;
pub mod trading;
