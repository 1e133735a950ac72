//! banfleet agent.
//!
//! Joins the orchestrator once to obtain an mTLS identity, then runs a
//! small control surface: a three-state lifecycle FSM drives XDP
//! attach/detach, a rule-watch stream feeds the kernel banlist, and a
//! reporter uploads status under a liveness lease.

pub mod client;
pub mod cmd;
pub mod config;
pub mod error;
pub mod fsm;
pub mod notify;
pub mod reporter;
pub mod service;
pub mod watcher;
pub mod xdp;
