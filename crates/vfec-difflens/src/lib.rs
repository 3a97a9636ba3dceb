//! Zero-context diff parsing, vulnerable/fixed line alignment, and test
//! relevance filtering.

pub mod mapper;
pub mod parser;
pub mod relevance;
