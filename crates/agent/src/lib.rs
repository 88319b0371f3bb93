//! Node QoS agent
//!
//! Provides:
//! - [`config::AgentConfig`]: file and environment configuration
//! - [`api`]: health, metrics, status and valve endpoints

pub mod api;
pub mod config;
