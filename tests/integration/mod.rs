//! Integration test suite for glassdome.
//!
//! These tests drive whole deployments through the public orchestrator
//! surface against the in-memory platform backend. They verify that graph
//! building, scheduling, persistence and teardown work together.
//!
//! # Test Categories
//!
//! - `deployment_e2e`: Provisioning from submit to a terminal status
//! - `failure_handling`: Retries, poisoning and rejected labs
//! - `teardown`: Reverse-order deletion and repeatable teardown
//! - `recovery`: Resuming deployments after a crash
//! - `platform_contract`: Adapter behaviour the orchestrator relies on
//! - `properties`: Randomized graph and scheduling invariants
//!
//! # CI Compatibility
//!
//! No test reaches a real backend; every platform call lands in
//! `InMemoryPlatform`.


mod failure_handling;
mod platform_contract;
mod recovery;
mod teardown;
