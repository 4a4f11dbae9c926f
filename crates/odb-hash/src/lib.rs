//! Digest selection and object identity for the odbpack object store.
//!
//! Everything a pack or index writer needs to talk about object ids: the
//! `HashAlgorithm` selector (threaded explicitly through writers and readers,
//! never process-global), the `ObjectId` value type, streaming hashing, the
//! hex codec, and the 256-entry fan-out table used by index files.

mod algorithm;
mod error;
pub mod fanout;
pub mod hasher;
pub mod hex;
mod oid;

pub use algorithm::HashAlgorithm;
pub use error::HashError;
pub use oid::ObjectId;
