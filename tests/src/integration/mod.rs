//! Integration flows across the shared crates.

pub mod gateway_flow;
pub mod ratelimit_flow;
pub mod resilience_flow;
