//! Domain model module declarations.

pub mod annotation;
pub mod layout;
pub mod queue;
pub mod record;
pub mod result;
