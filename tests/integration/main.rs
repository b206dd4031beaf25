//! End-to-end tests against a deterministic in-memory exchange.

mod mock_exchange;
mod simulation;
