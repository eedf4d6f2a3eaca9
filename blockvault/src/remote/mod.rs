//! Optional ambient surface: a synchronous, TLS-secured client/server pair
//! that fronts a local [`crate::storage::ObjectStorage`] for a remote
//! caller (§4.11, §6). Nothing above L0 depends on this module; an archive
//! built from [`crate::remote::client::RemoteClient`] in place of
//! [`crate::storage::disk_object::DiskObjectStore`] is otherwise identical.

pub mod client;
pub mod server;
pub mod tls;
pub mod wire;

pub use client::RemoteClient;
pub use server::RemoteServer;
pub use tls::{generate_identity, TlsIdentity};
