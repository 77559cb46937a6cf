//! cloudbd Client - Remote object store access
//!
//! The block layer talks to its backing store only through the
//! [`RemoteStoreClient`] and [`Authenticator`] traits defined here. Two
//! backends are provided:
//!
//! - [`MemoryStore`]: in-process store shared by every client it hands out,
//!   with fault injection and call accounting for tests
//! - [`DirStore`]: containers as directories and objects as files

pub mod dir;
pub mod memory;
pub mod store;

// Re-exports
pub use dir::{DirAuthenticator, DirStore};
pub use memory::{MemoryStore, StoreOp};
pub use store::{Authenticator, ContainerInfo, ObjectInfo, RemoteStoreClient};
