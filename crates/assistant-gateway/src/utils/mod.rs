//! Utilities module - text helpers and best-effort JSON extraction

pub mod text_utils;
pub mod json_extract;

pub use text_utils::TextUtils;
pub use json_extract::{extract_object, extract_object_with_repair, ExtractError};
