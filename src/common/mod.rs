//! Small shared building blocks.

pub mod datetime;
