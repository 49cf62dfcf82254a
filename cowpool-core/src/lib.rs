// vim: tw=80
//! The storage pool allocator core of cowpool: transaction groups, space
//! maps, metaslabs, the vdev tree, and the sequential rebuild engine.
//!
//! This crate is the durability core.  The object layer above it (and any
//! user-facing surface) talks to it through the `Objset` seam, the txg
//! hold/release protocol, and zio submission.

pub mod checksum;
pub mod draid;
pub mod metaslab;
pub mod nvlist;
pub mod objset;
pub mod rebuild;
pub mod spa;
pub mod space_map;
pub mod stream;
pub mod taskq;
pub mod txg;
pub mod types;
pub mod util;
pub mod vdev;
pub mod zio;

pub use types::{Error, Guid, Result, TxgT};
