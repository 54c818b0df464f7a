//! The shuffle tracker: rendezvous service for reducers and mappers.
//!
//! Mappers publish where their splits are served; reducers register, ask
//! where to pull each split from, give back leases with their transfer
//! statistics and report their lifecycle.

pub mod client;
pub mod registry;
pub mod server;

pub use client::*;
pub use registry::*;
pub use server::*;
