//! Data models for GitHub Actions workflow definitions and related
//! configuration files.
//!
//! These are "schema" models: they capture the YAML surface of a
//! workflow with ordering preserved, and intentionally carry no
//! positional or analysis state.

#![forbid(unsafe_code)]

pub mod common;
pub mod dependabot;
pub mod workflow;
