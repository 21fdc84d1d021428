//! Data models.

mod annotation;
mod identity;

pub use annotation::{Annotation, DecodeError, IndexRecord};
pub use identity::{Group, Principal, Profile};
