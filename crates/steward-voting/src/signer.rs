use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer as EthersSigner};
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Signature};

use crate::error::VoteError;

/// Signing seam for the vote paths. The process identity signs EIP-712
/// typed data; everything else about submission lives in the executor.
#[async_trait]
pub trait VoteSigner: Send + Sync {
    fn address(&self) -> Address;
    async fn sign_typed_data(&self, data: &TypedData) -> Result<Signature, VoteError>;
}

/// In-process key held in memory, loaded from configuration. The key file
/// itself is persisted with owner-only permissions by the state layer.
pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    /// Ephemeral identity for dry runs, where nothing is ever signed.
    pub fn random(chain_id: u64) -> Self {
        let wallet = LocalWallet::new(&mut rand::thread_rng()).with_chain_id(chain_id);
        Self { wallet }
    }

    pub fn from_private_key(hex_key: &str, chain_id: u64) -> Result<Self, VoteError> {
        let wallet = hex_key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|err| VoteError::Signer(format!("invalid private key: {err}")))?
            .with_chain_id(chain_id);
        Ok(Self { wallet })
    }
}

#[async_trait]
impl VoteSigner for LocalWalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_typed_data(&self, data: &TypedData) -> Result<Signature, VoteError> {
        EthersSigner::sign_typed_data(&self.wallet, data)
            .await
            .map_err(|err| VoteError::Signer(err.to_string()))
    }
}

/// Canonical lowercase hex form used in envelopes and service payloads.
pub(crate) fn address_hex(address: Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}
