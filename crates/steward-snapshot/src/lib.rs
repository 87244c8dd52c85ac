mod client;
mod error;
mod relay;

pub use client::SnapshotClient;
pub use error::SnapshotError;
pub use relay::{RelayClient, RelayReceipt, VoteEnvelope};
