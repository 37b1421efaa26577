//! Filesystem notifications turned into typed acquisition events.

pub mod classifier;

pub use classifier::{classify, ChangeKind, ClassifiedEvent, FileShape};
