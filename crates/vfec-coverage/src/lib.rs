//! Coverage side of the differential: LCOV indexing, per-test accumulator
//! handling, and the diff/coverage join.

pub mod accumulator;
pub mod joiner;
pub mod lcov;
pub mod output;
