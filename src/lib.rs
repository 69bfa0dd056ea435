//! Core library for `devsim`: a small concurrent device simulator
//! exposing named, typed, bounded process variables and simulated motors
//! over a line-oriented TCP protocol.

pub mod config;
pub mod logging;
pub mod numeric;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod supervisor;
