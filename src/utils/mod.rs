//! Shared utility functions.

pub mod json_extraction;

pub use json_extraction::{balanced_objects, find_matching_brace, json_code_blocks};
