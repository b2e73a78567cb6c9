//! Authentication module for Vetline

pub mod identity;
pub mod jwt;

pub use identity::{optional_identity, require_identity, Identity};
pub use jwt::{Claims, JwtManager};
