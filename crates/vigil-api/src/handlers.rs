//! Request handlers.

pub mod health;
pub mod rules;
pub mod streams;

pub use health::*;
pub use rules::*;
pub use streams::*;
