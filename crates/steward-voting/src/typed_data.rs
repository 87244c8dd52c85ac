use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, U256};
use serde_json::{json, Value};

use crate::error::VoteError;
use crate::signer::address_hex;

const VOTE_DOMAIN_NAME: &str = "snapshot";
const VOTE_DOMAIN_VERSION: &str = "0.1.4";

/// Hex proposal ids of 32 bytes are hashes and go on the wire as
/// `bytes32`; anything else (legacy ids, IPFS CIDs) stays a `string`.
fn proposal_id_is_bytes32(proposal_id: &str) -> bool {
    proposal_id.len() == 66
        && proposal_id.starts_with("0x")
        && proposal_id[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Builds the hub vote message for off-chain submission. Returns both the
/// parsed typed data (for signing) and the raw JSON (for the envelope).
pub fn build_vote_typed_data(
    voter: Address,
    space: &str,
    proposal_id: &str,
    choice: u32,
    timestamp: i64,
    metadata: &str,
) -> Result<(TypedData, Value), VoteError> {
    let proposal_type = if proposal_id_is_bytes32(proposal_id) {
        "bytes32"
    } else {
        "string"
    };

    let raw = json!({
        "types": {
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" }
            ],
            "Vote": [
                { "name": "from", "type": "address" },
                { "name": "space", "type": "string" },
                { "name": "timestamp", "type": "uint64" },
                { "name": "proposal", "type": proposal_type },
                { "name": "choice", "type": "uint32" },
                { "name": "metadata", "type": "string" }
            ]
        },
        "primaryType": "Vote",
        "domain": {
            "name": VOTE_DOMAIN_NAME,
            "version": VOTE_DOMAIN_VERSION
        },
        "message": {
            "from": address_hex(voter),
            "space": space,
            "timestamp": timestamp,
            "proposal": proposal_id,
            "choice": choice,
            "metadata": metadata
        }
    });

    let typed: TypedData = serde_json::from_value(raw.clone())
        .map_err(|err| VoteError::Encode(format!("typed data: {err}")))?;
    Ok((typed, raw))
}

/// Governor call arguments carry the proposal id as a uint256, parsed from
/// either its hex or decimal string form.
pub fn parse_proposal_uint(proposal_id: &str) -> Result<U256, VoteError> {
    let parsed = if let Some(hex_part) = proposal_id.strip_prefix("0x") {
        U256::from_str_radix(hex_part, 16).map_err(|err| err.to_string())
    } else {
        U256::from_dec_str(proposal_id).map_err(|err| err.to_string())
    };
    parsed.map_err(|err| VoteError::Encode(format!("proposal id `{proposal_id}`: {err}")))
}
