//! Utilities for testing code that talks to AMT relays. They are used for testing the gateway
//!  itself, and they are exported for application testing.

pub mod fake_relay;
