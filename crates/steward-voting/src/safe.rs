use std::time::Duration;

use ethers::abi::Token;
use ethers::types::transaction::eip712::{Eip712, TypedData};
use ethers::types::{Address, U256};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::VoteError;
use crate::signer::{address_hex, VoteSigner};

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// A Safe multisig transaction with the relayer-friendly zero gas fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeTransaction {
    pub safe: String,
    pub to: String,
    pub value: String,
    pub data: String,
    pub operation: u8,
    pub safe_tx_gas: u64,
    pub base_gas: u64,
    pub gas_price: u64,
    pub gas_token: String,
    pub refund_receiver: String,
    pub nonce: u64,
}

/// Client for the Safe transaction service: nonce lookup, owner-signed
/// proposal of transactions, and the liveness self-transfer.
pub struct SafeClient {
    http: reqwest::Client,
    service_url: String,
    safe: Address,
    chain_id: u64,
    deadline: Duration,
}

impl SafeClient {
    pub fn new(
        service_url: impl Into<String>,
        safe: Address,
        chain_id: u64,
        deadline: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            service_url: service_url.into(),
            safe,
            chain_id,
            deadline,
        }
    }

    pub fn safe_address(&self) -> Address {
        self.safe
    }

    /// ABI payload for a governor vote; carries the reason variant when a
    /// non-empty reason is given.
    pub fn encode_cast_vote(proposal_id: U256, support: u8, reason: Option<&str>) -> Vec<u8> {
        match reason.filter(|r| !r.is_empty()) {
            Some(reason) => {
                let selector = ethers::utils::id("castVoteWithReason(uint256,uint8,string)");
                let encoded = ethers::abi::encode(&[
                    Token::Uint(proposal_id),
                    Token::Uint(U256::from(support)),
                    Token::String(reason.to_string()),
                ]);
                [selector.as_slice(), &encoded].concat()
            }
            None => {
                let selector = ethers::utils::id("castVote(uint256,uint8)");
                let encoded = ethers::abi::encode(&[
                    Token::Uint(proposal_id),
                    Token::Uint(U256::from(support)),
                ]);
                [selector.as_slice(), &encoded].concat()
            }
        }
    }

    pub fn build_transaction(&self, to: Address, data: Vec<u8>, nonce: u64) -> SafeTransaction {
        SafeTransaction {
            safe: address_hex(self.safe),
            to: address_hex(to),
            value: "0".to_string(),
            data: format!("0x{}", hex::encode(data)),
            operation: 0,
            safe_tx_gas: 0,
            base_gas: 0,
            gas_price: 0,
            gas_token: ZERO_ADDRESS.to_string(),
            refund_receiver: ZERO_ADDRESS.to_string(),
            nonce,
        }
    }

    /// EIP-712 hash the owners sign and the service uses as the
    /// transaction identity.
    pub fn contract_tx_hash(&self, tx: &SafeTransaction) -> Result<([u8; 32], TypedData), VoteError> {
        let raw = json!({
            "types": {
                "EIP712Domain": [
                    { "name": "chainId", "type": "uint256" },
                    { "name": "verifyingContract", "type": "address" }
                ],
                "SafeTx": [
                    { "name": "to", "type": "address" },
                    { "name": "value", "type": "uint256" },
                    { "name": "data", "type": "bytes" },
                    { "name": "operation", "type": "uint8" },
                    { "name": "safeTxGas", "type": "uint256" },
                    { "name": "baseGas", "type": "uint256" },
                    { "name": "gasPrice", "type": "uint256" },
                    { "name": "gasToken", "type": "address" },
                    { "name": "refundReceiver", "type": "address" },
                    { "name": "nonce", "type": "uint256" }
                ]
            },
            "primaryType": "SafeTx",
            "domain": {
                "chainId": self.chain_id,
                "verifyingContract": tx.safe
            },
            "message": {
                "to": tx.to,
                "value": tx.value,
                "data": tx.data,
                "operation": tx.operation,
                "safeTxGas": tx.safe_tx_gas,
                "baseGas": tx.base_gas,
                "gasPrice": tx.gas_price,
                "gasToken": tx.gas_token,
                "refundReceiver": tx.refund_receiver,
                "nonce": tx.nonce
            }
        });
        let typed: TypedData = serde_json::from_value(raw)
            .map_err(|err| VoteError::Encode(format!("safe typed data: {err}")))?;
        let hash = typed
            .encode_eip712()
            .map_err(|err| VoteError::Encode(format!("safe tx hash: {err}")))?;
        Ok((hash, typed))
    }

    pub async fn fetch_nonce(&self) -> Result<u64, VoteError> {
        let url = format!(
            "{}/api/v1/safes/{}/",
            self.service_url.trim_end_matches('/'),
            address_hex(self.safe)
        );
        let response = self
            .http
            .get(&url)
            .timeout(self.deadline)
            .send()
            .await
            .map_err(|err| VoteError::from_reqwest(err, self.deadline))?;
        let status = response.status();
        if !status.is_success() {
            return Err(VoteError::Transport(format!(
                "safe service returned {status} for nonce"
            )));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|err| VoteError::Transport(err.to_string()))?;
        payload
            .get("nonce")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| VoteError::Transport("nonce missing from safe service".to_string()))
    }

    /// Signs the transaction with the owner key and proposes it to the
    /// transaction service. Returns the safe transaction hash.
    pub async fn propose(
        &self,
        signer: &dyn VoteSigner,
        tx: &SafeTransaction,
    ) -> Result<String, VoteError> {
        let (hash, typed) = self.contract_tx_hash(tx)?;
        let signature = signer.sign_typed_data(&typed).await?;
        let tx_hash = format!("0x{}", hex::encode(hash));

        let mut body = serde_json::to_value(tx)
            .map_err(|err| VoteError::Encode(err.to_string()))?;
        let extra = json!({
            "contractTransactionHash": tx_hash,
            "sender": address_hex(signer.address()),
            "signature": format!("0x{signature}")
        });
        if let (Some(map), Some(extra_map)) = (body.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                map.insert(key.clone(), value.clone());
            }
        }

        let url = format!(
            "{}/api/v1/safes/{}/multisig-transactions/",
            self.service_url.trim_end_matches('/'),
            address_hex(self.safe)
        );
        let response = self
            .http
            .post(&url)
            .timeout(self.deadline)
            .json(&body)
            .send()
            .await
            .map_err(|err| VoteError::from_reqwest(err, self.deadline))?;

        let status = response.status();
        if status.is_success() {
            debug!(tx_hash, "safe transaction proposed");
            return Ok(tx_hash);
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(VoteError::Rejected(format!("{status}: {detail}")));
        }
        Err(VoteError::Transport(format!("{status}: {detail}")))
    }

    /// 0-value transfer from the Safe to itself, used to keep the daily
    /// on-chain activity requirement satisfied on vote-less days.
    pub async fn self_transfer(&self, signer: &dyn VoteSigner) -> Result<String, VoteError> {
        let nonce = self.fetch_nonce().await?;
        let tx = self.build_transaction(self.safe, Vec::new(), nonce);
        self.propose(signer, &tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SafeClient {
        SafeClient::new(
            "https://safe-transaction.example.com",
            "0x00000000000000000000000000000000000000F0"
                .parse()
                .expect("address"),
            100,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn cast_vote_uses_the_governor_selector() {
        let data = SafeClient::encode_cast_vote(U256::from(31u64), 1, None);
        assert_eq!(hex::encode(&data[..4]), "56781388");
        // selector + two abi words
        assert_eq!(data.len(), 4 + 32 * 2);
    }

    #[test]
    fn cast_vote_with_reason_switches_selector() {
        let data = SafeClient::encode_cast_vote(U256::from(31u64), 0, Some("too risky"));
        assert_eq!(hex::encode(&data[..4]), "7b3c71d3");
        assert!(data.len() > 4 + 32 * 3);
    }

    #[test]
    fn empty_reason_falls_back_to_plain_cast_vote() {
        let data = SafeClient::encode_cast_vote(U256::from(1u64), 2, Some(""));
        assert_eq!(hex::encode(&data[..4]), "56781388");
    }

    #[test]
    fn contract_hash_is_deterministic_and_nonce_sensitive() {
        let client = client();
        let to = client.safe_address();
        let tx_a = client.build_transaction(to, Vec::new(), 7);
        let tx_b = client.build_transaction(to, Vec::new(), 7);
        let tx_c = client.build_transaction(to, Vec::new(), 8);

        let (hash_a, _) = client.contract_tx_hash(&tx_a).expect("hash");
        let (hash_b, _) = client.contract_tx_hash(&tx_b).expect("hash");
        let (hash_c, _) = client.contract_tx_hash(&tx_c).expect("hash");
        assert_eq!(hash_a, hash_b);
        assert_ne!(hash_a, hash_c);
    }

    #[test]
    fn built_transactions_are_gasless_and_zero_value() {
        let client = client();
        let tx = client.build_transaction(client.safe_address(), Vec::new(), 3);
        assert_eq!(tx.value, "0");
        assert_eq!(tx.operation, 0);
        assert_eq!(tx.safe_tx_gas, 0);
        assert_eq!(tx.gas_token, ZERO_ADDRESS);
        assert_eq!(tx.refund_receiver, ZERO_ADDRESS);
        let raw = serde_json::to_value(&tx).expect("serialize");
        assert!(raw.get("safeTxGas").is_some());
        assert!(raw.get("refundReceiver").is_some());
    }
}
