//! An adaptive specialization and deoptimization engine for a bytecode virtual machine.
//!
//! The interpreter logs what it observes while running generic bytecode. From those logs the
//! engine plans specialized versions (candidates) of hot call targets, builds each one first as
//! an instrumented logging body, and later promotes it to an optimized body whose speculative
//! assumptions are protected by guards. A failed guard, or code invalidation while a call is in
//! flight, deoptimizes the affected frames back into generic bytecode.

#![allow(clippy::type_complexity)]
#![allow(clippy::comparison_chain)]

mod append_only;
mod builder;
pub mod bytecode;
pub mod callsite;
pub mod candidate;
mod codegen;
pub mod config;
mod context;
pub mod deopt;
pub mod errors;
pub mod frame;
pub mod frame_walker;
pub mod ir;
mod job_queue;
mod log;
mod optimize;
pub mod planner;
pub mod stats;
pub mod value;

pub use self::{
    candidate::{CallTarget, Candidate},
    config::SpeshConfig,
    context::RuntimeContext,
    errors::SpeshError,
};
