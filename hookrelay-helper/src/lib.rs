//! # hookrelay-helper — Hooking Helper Service
//!
//! Runs a simulated host application, hooks a configured set of its
//! imported APIs, and relays the resulting events to a controller
//! through the per-class rate limiter.
//!
//! The host's threads keep calling their APIs whether or not the
//! controller is reachable; the helper reconnects in the background.

pub mod config;
pub mod host;
pub mod service;
