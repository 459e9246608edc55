//! # psx-router
//!
//! A protocol-aware TCP router for PSX flight-sim network traffic: one
//! upstream link to the simulator, any number of downstream clients, a
//! synchronous Rule Engine deciding what crosses between them, and an
//! inter-router sub-protocol (FRDP) for chaining routers together.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod context;
pub mod control_api;
pub mod error;
pub mod forwarder;
pub mod listener;
pub mod logging;
pub mod message;
pub mod rdp;
pub mod rules;
pub mod supervisor;
pub mod upstream;
