//! Format tokens and the resolution engine

pub mod resolve;
pub mod token;

pub use resolve::{pick_preference, RegisteredDelegate, Resolved, Resolver};
pub use token::{coerce_version, supports, FormatToken, VersionSpec};
