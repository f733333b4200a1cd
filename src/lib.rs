//! Core library for the `fleetmark` CLI.
//!
//! This crate provides the building blocks used by the binary: the pub/sub
//! broker layer and wire protocol, remote exec sessions, benchmark tool
//! drivers, the fleet scheduler with its phased run loop, and the adaptive
//! send-rate search. The primary user-facing interface is the `fleetmark`
//! command-line application; library APIs may evolve as the CLI grows.
pub mod agent;
pub mod args;
pub mod broker;
pub mod config;
pub mod entry;
pub mod error;
pub mod logger;
pub mod orchestrator;
pub mod rate;
pub mod retry;
pub mod session;
pub mod tools;
pub mod wire;
