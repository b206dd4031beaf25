//! Core engine: the scan → enter → monitor → exit loop.

pub mod backoff;
pub mod scanner;
pub mod position;
pub mod accountant;
pub mod orchestrator;
