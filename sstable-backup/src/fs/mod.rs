//! Local filesystem layout of the node.

pub mod walker;
