//! Side-effecting adapters: bus transports, repositories, filesystem, git,
//! hosting API and configuration.

pub mod bus;
pub mod config;
pub mod git;
pub mod host;
pub mod patch;
pub mod store;
