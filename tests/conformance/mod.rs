//! Conformance scenarios and their shared process harness.

pub mod harness;
pub mod scenarios;
