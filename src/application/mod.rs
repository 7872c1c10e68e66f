//! Application layer: the record model and the persistence seam.

pub mod error;
pub mod records;
