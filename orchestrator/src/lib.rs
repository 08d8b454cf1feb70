//! Label-driven automation daemon.
//!
//! The orchestrator watches an issue tracker for issues carrying intent labels
//! (`ai-investigate`, `ai-fix`, ...) and, for each one, runs an external coding
//! agent against a scratch checkout of the repository, then reports back on the
//! issue or opens a pull request.
//!
//! - **[`core`]**: Pure logic (label worklists, template rendering, PR reference
//!   extraction, shared types). No I/O.
//! - **[`io`]**: Side-effecting adapters (configuration, tracker and repository
//!   clients, OAuth, git, agent subprocess).
//!
//! Orchestration lives in [`daemon`] (poll/lock state machine) and [`actions`]
//! (label-to-handler registry and the built-in handlers).

pub mod actions;
pub mod core;
pub mod daemon;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
