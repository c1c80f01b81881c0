//! Keeps a learner's edit buffer, editor models and an isolated sandbox
//! in step, and runs dependency installs, a preview dev server and the
//! test suite inside that sandbox.
//!
//! [`workspace::Workspace`] wires the pieces together for one session:
//!
//! - [`sandbox`]: backends, single-flight acquisition and mount trees
//! - [`provision`]: idempotent per-project setup with a dependency cache check
//! - [`devserver`]: preview server start, stop and reload
//! - [`testrun`]: test runs with status and captured output
//! - [`filesync`]: debounced buffer to sandbox sync
//! - [`editor`]: editor model bookkeeping
//! - [`fileops`]: create, delete and rename with structured errors

pub mod buffer;
pub mod config;
pub mod deps;
pub mod devserver;
pub mod editor;
pub mod fileops;
pub mod filesync;
pub mod project;
pub mod provision;
pub mod sandbox;
pub mod session;
pub mod terminal;
pub mod testrun;
pub mod workspace;
