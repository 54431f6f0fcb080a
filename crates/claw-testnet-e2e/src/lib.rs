//! Docker-backed end-to-end tests for claw-testnet.
//!
//! These tests drive a real container engine:
//! - Network provisioning and subnet isolation
//! - Node start, stop, restart and readiness gating
//! - Volume persistence across node removal and reattach
//! - Label-driven teardown and orphan sweeping
//!
//! All suites are ignored by default; run them with
//! `cargo test -p claw-testnet-e2e -- --ignored`.

#![cfg(test)]
