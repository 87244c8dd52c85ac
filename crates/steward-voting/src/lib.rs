mod error;
mod executor;
mod safe;
mod signer;
mod typed_data;

pub use ethers::types::Address;

pub use error::VoteError;
pub use executor::{ExecutorConfig, VoteExecutor};
pub use safe::{SafeClient, SafeTransaction};
pub use signer::{LocalWalletSigner, VoteSigner};
pub use typed_data::{build_vote_typed_data, parse_proposal_uint};
