//! Shared utilities for Bindery
//!
//! Helpers used by more than one protocol adapter.

pub mod name_sanitizer;
pub mod json_pointer;

pub use json_pointer::{escape_pointer_segment, unescape_pointer_segment};
pub use name_sanitizer::{is_valid_key, sanitize_key, KeyAllocator, UNNAMED_KEY};
