//! File system access: traversal and content hashing.

pub mod hasher;
pub mod walker;
