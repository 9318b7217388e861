//! Operators over change-stream connections.
//!
//! Every operator is a method on [`Connection`](crate::connect::Connection)
//! that consumes it and returns a new connection (or a handle), so chains
//! compose freely. Each operator module documents its own semantics.

pub mod batch_if;
pub mod bind;
pub mod buffer;
pub mod combine;
pub mod limit;
pub mod query;
pub mod subscribe_each;
pub mod transform;
