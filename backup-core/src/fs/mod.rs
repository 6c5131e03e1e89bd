//! File system helpers for archive sources.

pub mod walker;
