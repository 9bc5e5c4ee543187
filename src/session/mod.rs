//! Session state and the durable storage it lives in.

pub mod storage;
mod store;

pub use store::{SessionStore, SessionUpdate};
