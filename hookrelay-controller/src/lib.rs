//! # hookrelay-controller — Helper Controller
//!
//! Listens for helpers, keeps one session per helper process, and
//! journals every event, resync and channel loss they produce.

pub mod config;
pub mod journal;
pub mod service;
