//! Pure building blocks: wildcard matching, story identity, and the
//! configuration error shared by every layer above.

pub mod error;
pub mod pattern;
pub mod story;
