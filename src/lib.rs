//! Adaptive review scheduling for hands-on command-line courses.
//!
//! A forgetting-curve memory model decides when each skill is due again, a
//! mastery gate holds learners back from labs until prerequisites are solid,
//! and a twelve-tier priority cascade picks the single next thing to show.

pub mod canonical;
pub mod config;
pub mod content;
pub mod db;
pub mod engine;
pub mod error;
pub mod mastery;
pub mod memory;
pub mod models;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod struggle;

pub use engine::Engine;
pub use error::{EngineError, Result};
