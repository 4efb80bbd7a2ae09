//! Funding addresses held by the storage service on our behalf.

use serde::{Deserialize, Serialize};

/// A wallet address provisioned under a storage-service session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub addr: String,
    pub name: String,
    /// Key scheme tag, e.g. `bls` or `secp256k1`.
    #[serde(rename = "type")]
    pub kind: String,
    pub balance: u64,
}

impl WalletAddress {
    pub fn with_balance(mut self, balance: u64) -> Self {
        self.balance = balance;
        self
    }
}
