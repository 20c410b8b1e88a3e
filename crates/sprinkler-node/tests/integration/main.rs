//! Integration test entry point for sprinkler-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod convergence;
mod loss;
