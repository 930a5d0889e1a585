//! Authorization policy: applicability rules and status combination.

pub mod access;
pub mod applicability;
