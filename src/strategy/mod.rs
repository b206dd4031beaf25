//! Strategy: technical indicators, opportunity scoring and the daily risk
//! governor. Everything here is pure computation over prices and ledger
//! aggregates; no I/O.

pub mod indicators;
pub mod scoring;
pub mod governor;
