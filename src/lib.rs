//! agentdeck - know which of your coding agents needs you
//!
//! Tracks agent sessions launched in pseudo-terminals alongside the ones
//! running in other terminal windows, and keeps one authoritative
//! idle/running/waiting/completed/failed state per session from four
//! sources: terminal output, the agent's transcript file, hook events and
//! the OS process table.

pub mod classifier;
pub mod config;
pub mod correlator;
pub mod daemon;
pub mod detection;
pub mod hooks;
pub mod notifier;
pub mod platform;
pub mod pty;
pub mod registry;
pub mod session;
pub mod transcript;
