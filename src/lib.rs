//! Metronome - load-time timing probes for class-loader transformers
//!
//! This library rewrites the class loader's transformer loop so that each
//! class transformation, and each transformer within it, is bracketed with
//! calls into a timing aggregator. It provides the class file codec, the
//! pattern-matching rewriter, the selective patcher, the load-time
//! interceptor and the aggregator the probes report to.

pub mod agent;
pub mod bytecode;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod json_output;
pub mod patcher;
pub mod rewriter;
pub mod timing;
