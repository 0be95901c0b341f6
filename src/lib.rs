#![warn(missing_docs)]
//! Blockindex B+Tree
//!
//! # Implementation Details
//!
//! Provides the in-memory index structure of a record-oriented storage
//! engine: a B+Tree mapping variable-length byte-string keys to the ids of
//! the fixed-size blocks that hold the matching records.
//!
//! The tree is composed of nodes, which are all stored in an in-memory
//! arena. Each node has a unique index and the index is used to reference
//! the node from the set of known nodes; parent links are plain indices
//! back into the arena, so the arena is the only owner of a node.
//!
//! A node is either:
//!  - Leaf node, contains keys and block ids, plus a link to the leaf on
//!    its right
//!  - Internal node, contains keys and child node indices, each key being
//!    the smallest key reachable in that child
//!
//! Key ordering is not decided here. Every operation consults a
//! [`comparator::KeyComparator`] supplied by the embedding storage layer,
//! which knows whether a column holds big-endian integers, strings, or
//! something else entirely.
//!
//! The index is rebuilt from a block scan by the table layer rather than
//! persisted, so there is no file format and nothing to recover; a tree
//! lives and dies with its process.

pub mod btree;
pub mod comparator;
