//! Deterministic, pure logic shared by the foreman core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod approval;
pub mod branch;
pub mod patch;
pub mod providers;
pub mod remote;
pub mod subjects;
pub mod transitions;
pub mod types;
