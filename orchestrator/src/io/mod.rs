//! Side-effecting adapters: configuration, subprocesses, HTTP collaborators.

pub mod agent;
pub mod comments;
pub mod config;
pub mod git;
pub mod oauth;
pub mod process;
pub mod repo;
pub mod tracker;
