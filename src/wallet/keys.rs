//! Private key lookup and payload signing

use crate::config::WalletConfig;
use crate::error::{EngineError, EngineResult};

use super::SignedTransaction;

use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::H256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap};

/// Resolves the private key of a wallet address
pub trait KeyStore: Send + Sync {
    fn private_key(&self, address: &str) -> Option<String>;
}

/// Keys read from environment variables named in the configuration
pub struct EnvKeyStore {
    vars: HashMap<String, String>,
}

impl EnvKeyStore {
    pub fn new(config: &WalletConfig) -> Self {
        Self {
            vars: config.private_key_env.clone(),
        }
    }
}

impl KeyStore for EnvKeyStore {
    fn private_key(&self, address: &str) -> Option<String> {
        self.vars
            .get(address)
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: DashMap<String, String>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: impl Into<String>, private_key: impl Into<String>) {
        self.keys.insert(address.into(), private_key.into());
    }
}

impl KeyStore for InMemoryKeyStore {
    fn private_key(&self, address: &str) -> Option<String> {
        self.keys.get(address).map(|k| k.clone())
    }
}

/// Signature of one address over the payload digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSignature {
    pub address: String,
    pub signature: String,
}

/// What the signed blob decodes to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope<T> {
    pub payload: T,
    pub signatures: Vec<PayloadSignature>,
}

/// Parsed signing keys of the addresses funding one record
pub struct SigningKeys {
    wallets: BTreeMap<String, LocalWallet>,
}

impl SigningKeys {
    /// Load keys for every address; `MissingPrivateKey` names the first
    /// address without one.
    pub fn load<'a>(
        store: &dyn KeyStore,
        addresses: impl IntoIterator<Item = &'a str>,
    ) -> EngineResult<Self> {
        let mut wallets = BTreeMap::new();
        for address in addresses {
            let key = store
                .private_key(address)
                .ok_or_else(|| EngineError::MissingPrivateKey {
                    address: address.to_string(),
                })?;
            let wallet = key
                .trim()
                .trim_start_matches("0x")
                .parse::<LocalWallet>()
                .map_err(|e| EngineError::Signing(format!("Invalid private key for {}: {}", address, e)))?;
            wallets.insert(address.to_string(), wallet);
        }
        Ok(Self { wallets })
    }

    /// Sign the keccak digest of the canonical JSON payload with every key
    pub fn sign(&self, payload: &Value) -> EngineResult<SignedTransaction> {
        let digest = keccak(&serde_json::to_vec(payload).map_err(signing_error)?);

        let mut signatures = Vec::with_capacity(self.wallets.len());
        for (address, wallet) in &self.wallets {
            let signature = wallet
                .sign_hash(H256::from_slice(&digest))
                .map_err(|e| EngineError::Signing(e.to_string()))?;
            signatures.push(PayloadSignature {
                address: address.clone(),
                signature: hex::encode(signature.to_vec()),
            });
        }

        let envelope = SignedEnvelope {
            payload: payload.clone(),
            signatures,
        };
        let blob = serde_json::to_vec(&envelope).map_err(signing_error)?;

        Ok(SignedTransaction {
            hash: hex::encode_upper(keccak(&blob)),
            blob: hex::encode(blob),
        })
    }
}

/// Decode a blob produced by `SigningKeys::sign`
pub fn decode_blob<T: DeserializeOwned>(blob: &str) -> EngineResult<SignedEnvelope<T>> {
    let bytes = hex::decode(blob)
        .map_err(|e| EngineError::Internal(format!("Malformed signed blob: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::Internal(format!("Malformed signed payload: {}", e)))
}

fn keccak(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

fn signing_error(e: serde_json::Error) -> EngineError {
    EngineError::Signing(e.to_string())
}
