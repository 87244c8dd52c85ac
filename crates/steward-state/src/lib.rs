mod canonical;
mod decision_log;
mod error;
mod store;

pub use canonical::{canonical_json, checksum_hex};
pub use decision_log::DecisionLog;
pub use error::StateError;
pub use store::{LoadOptions, Migration, SaveOptions, StateStore};
