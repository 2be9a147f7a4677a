//! nmc - a self-healing round-robin reverse proxy over a pool of nginx
//! workers.
//!
//! The library exposes the pieces the `nmc` binary is built from so they can
//! be driven from tests with a fake [`runtime::WorkerRuntime`].

pub mod cluster;
pub mod config;
pub mod error;
pub mod runtime;
pub mod ui;

pub use error::{Error, Result};
