//! Devloop - autonomous PRD-driven development loop
//!
//! Drives an external code-generating agent through an iterative
//! propose-validate-test-retry cycle until every task in a PRD reaches a
//! terminal state or exhausts its retry budget:
//! - Task scheduling with retry accounting and fix-task synthesis
//! - Agent supervision over a local stream socket (newline-delimited JSON)
//! - Pre-apply validation of proposed change-sets
//! - Pattern memory that feeds preventive guidance into future prompts
//! - Bounded in-process event bus with polling consumers

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::models::config::Config;
pub use services::event_bus::EventBus;
