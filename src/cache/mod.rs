//! Persistent provider storage.

pub mod file;
pub mod format;
