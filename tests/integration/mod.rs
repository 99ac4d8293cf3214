//! Integration test suite for floodgate.
//!
//! These tests drive whole runs through the public API: registry,
//! executor, scheduler and the config-driven pipeline wiring.
//!
//! # Test Categories
//!
//! - `run_policy`: required/optional failure handling and task ordering
//! - `scheduling`: single-run admission, trigger rejection, cadence loop
//! - `config_pipeline`: runs built from a TOML config with real subprocesses
//!
//! # CI Compatibility
//!
//! Actions are in-process closures or `sh -c` snippets; no dbt install or
//! network access is needed.


mod config_pipeline;
mod run_policy;
mod scheduling;
