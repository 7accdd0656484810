//! Identifiers and the request scope shared by the saga and messaging crates.

pub mod scope;
pub mod types;

pub use scope::RequestScope;
pub use types::{AppId, MessageId};
