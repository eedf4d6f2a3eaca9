//! Low-level, allocation-free encoding primitives shared by several layers
//! of the persistence stack: the binary-tree arithmetic that both the
//! integrity Merkle tree and the Path-ORAM layer are built on, and the
//! variable-length integer encoding used for AEAD associated data, HKDF
//! info strings, and the remote wire protocol's length-prefixed maps.
//!
//! This crate is `no_std` (with `alloc` for the varint encode path) because
//! nothing in it needs an allocator beyond a small growable buffer, and
//! keeping it free of `std` keeps the dependency graph of the numeric core
//! honest about what it actually needs.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod tree;
pub mod varint;

pub use tree::{parent_step, root_node, tree_width};
pub use varint::{decode_u64, encode_u64, VarintError};
