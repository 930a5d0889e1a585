//! Wire and interchange formats consumed by providers.

pub mod receipt;
