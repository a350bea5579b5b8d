//! Memory management for thread stacks.

pub mod stack;

pub use stack::{Stack, DEFAULT_STACK_SIZE, MIN_STACK_SIZE, STACK_CANARY};
