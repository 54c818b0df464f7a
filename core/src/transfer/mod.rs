//! Block transfer between mappers and reducers.

pub mod scheduler;
pub mod server;
pub mod store;

pub use scheduler::*;
pub use server::*;
pub use store::*;
