//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod board;
pub mod context;
pub mod dedup;
pub mod directive;
pub mod folding;
pub mod goal;
pub mod loop_detector;
pub mod parser;
pub mod text;
pub mod types;
