//! # Quest Platform Test Suite
//!
//! Cross-crate flows that no single crate can test on its own.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── gateway_flow.rs     # HTTP gateway → query/command buses → services
//!     ├── resilience_flow.rs  # broker outages, timeouts and breaker recovery
//!     └── ratelimit_flow.rs   # middleware precedence and algorithms over time
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p platform-tests
//!
//! # By flow
//! cargo test -p platform-tests integration::gateway_flow
//!
//! # Benchmarks
//! cargo bench -p platform-tests
//! ```

#![allow(dead_code)]

pub mod integration;
