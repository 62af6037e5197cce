//! Core domain types for NGM.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the dashboard.

mod escape;
mod profile;
mod text;

pub use escape::escape_html;
pub use profile::{ModulePermission, PermissionSnapshot, UserProfile};
pub use text::{take_chars, truncate_with_ellipsis};
