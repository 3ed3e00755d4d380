//! # ams-transform
//!
//! A bytecode transform stage for Android builds: it reads every compiled
//! class of a build (class directories and jars, across the module, its
//! sub-modules and external libraries), applies declarative instrumentation
//! rules, and hands the possibly rewritten classes to the next stage.
//!
//! ## Architecture
//!
//! - **constant_pool**: Constant pool parsing, lookups and appends
//! - **classfile**: Class file reader producing `ParsedClass`
//! - **bytecode**: Opcode table, instruction decoding and stack effects
//! - **stackmap**: StackMapTable decoding and encoding
//! - **relocate**: Code insertion with branch, table and frame remapping
//! - **verify**: Local stack-depth verifier for rewritten methods
//! - **rules**: Instrumentation ruleset, matching and conflict detection
//! - **filter**: Include/exclude class name patterns
//! - **rewrite**: Class serialization with the applied-rules marker
//! - **artifact**: Class artifacts, input units and content hashes
//! - **scan**: Directory input enumeration
//! - **jar**: Jar rewriting, in memory or streamed
//! - **state**: Incremental state persisted with heed (LMDB)
//! - **stage**: Host contract: stage declaration, invocation, output layout
//! - **pipeline**: The driver running units on a worker pool
//! - **plugin**: Registration of settings and stage with the host
//! - **report**: Run report and run-level errors
//! - **config**: Settings file, validated build settings, state paths
//! - **error**: Per-artifact error taxonomy
//! - **telemetry**: tracing subscriber setup

pub mod artifact;
pub mod bytecode;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod constant_pool;
pub mod error;
pub mod filter;
pub mod jar;
pub mod pipeline;
pub mod plugin;
pub mod relocate;
pub mod report;
pub mod rewrite;
pub mod rules;
pub mod scan;
pub mod stackmap;
pub mod stage;
pub mod state;
pub mod telemetry;
pub mod verify;

#[cfg(test)]
mod fixture;
