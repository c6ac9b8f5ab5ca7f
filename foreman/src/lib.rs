//! Task orchestration and patch composition for coding agents.
//!
//! Agents receive work over a subject-addressed bus, stream logs and status
//! back, and publish structured patches. Foreman tracks tasks and runs,
//! applies patches deterministically, evaluates approval policies and turns
//! finished runs into pushed branches and change requests. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (transitions, patch planning,
//!   approval evaluation, branch naming). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (bus backends, repositories,
//!   filesystem, git, hosting API, config). Isolated behind traits so tests
//!   can substitute fakes.
//!
//! Orchestration modules ([`orchestrator`], [`composer`], [`presence`],
//! [`serve`]) coordinate core logic with I/O.

pub mod composer;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod presence;
pub mod serve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
