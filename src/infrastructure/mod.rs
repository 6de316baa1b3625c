//! Infrastructure layer: IPC transport, configuration, logging, persistence.

pub mod config;
pub mod ipc;
pub mod logging;
pub mod persistence;
