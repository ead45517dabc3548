//! Core library for the mylm personal-assistant orchestration runtime.
//!
//! The runtime sits between chat channels and an LLM-driven agent loop. It
//! owns five tightly coupled subsystems: the per-channel [`queue`], the
//! per-user [`session`] cache, the durable [`projections`] store, the bounded
//! concurrent [`workers`] subsystem, and the unified [`scheduler`]. The
//! [`dispatcher`] glues them together; [`reflection`] and [`crash_recovery`]
//! round out the supporting cast.

#![deny(unsafe_code)]

pub mod approval;
pub mod audit;
pub mod bridge;
pub mod builtin_tools;
pub mod config;
pub mod crash_recovery;
pub mod dispatcher;
pub mod error;
pub mod fsutil;
pub mod llm;
pub mod memory;
pub mod projections;
pub mod queue;
pub mod reflection;
pub mod scheduler;
pub mod session;
pub mod tool;
pub mod workers;

pub use error::{CoreError, CoreResult};
