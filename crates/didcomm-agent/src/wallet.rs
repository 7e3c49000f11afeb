//! Wallet collaborator.
//!
//! The wallet owns keys and credentials. The engine never looks inside a
//! signature or proof; it only asks the wallet to produce or check one.
//!
//! Handlers call the wallet before the record transition is committed. If the
//! commit then fails the peer retransmits and the same wallet call runs again,
//! so the operations with side effects must be idempotent:
//!
//! - [`Wallet::issue_credential`] returns the same credential for the same
//!   exchange id.
//! - [`Wallet::store_credential`] returns the same wallet id for the same
//!   credential id.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use didcomm_proto::{
    Did, ExchangeId,
    payloads::{Attributes, Credential},
};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::WalletError;

/// Key and credential operations the engine delegates.
#[async_trait]
pub trait Wallet: Send + Sync + 'static {
    /// Create a fresh pairwise DID
    async fn create_did(&self) -> Result<Did, WalletError>;

    /// Produce the signed, opaque part of a credential offer
    async fn sign_offer(
        &self,
        schema_id: &str,
        attributes: &Attributes,
    ) -> Result<Value, WalletError>;

    /// Issue a credential for `subject` within `exchange`.
    ///
    /// Calling this again for an exchange that already has a credential
    /// returns that credential unchanged.
    async fn issue_credential(
        &self,
        exchange: ExchangeId,
        issuer: &Did,
        subject: &Did,
        schema_id: &str,
        attributes: &Attributes,
    ) -> Result<Credential, WalletError>;

    /// Check a received credential's proof
    async fn verify(&self, credential: &Credential) -> Result<(), WalletError>;

    /// Store a verified credential, returning the wallet's id for it.
    ///
    /// Storing a credential whose `id` is already held returns the existing
    /// wallet id and keeps a single entry.
    async fn store_credential(&self, credential: &Credential) -> Result<String, WalletError>;

    /// Pick a stored credential of `schema_id` that carries every requested
    /// attribute
    async fn present(
        &self,
        schema_id: &str,
        requested: &BTreeSet<String>,
    ) -> Result<Credential, WalletError>;
}

const PROOF_TYPE: &str = "MemoryWalletProof";

#[derive(Debug, Default)]
struct Contents {
    /// Wallet id to stored credential
    credentials: HashMap<String, Credential>,
    /// Credential id to wallet id
    stored: HashMap<String, String>,
    issued: HashMap<ExchangeId, Credential>,
}

/// Development wallet keeping everything in memory.
///
/// DIDs use the `did:peer` method with random identifiers. Proofs are
/// structural only: they name the issuer and the credential id, which is
/// enough for two in-memory wallets to accept each other's credentials.
#[derive(Debug, Default)]
pub struct MemoryWallet {
    contents: Mutex<Contents>,
}

impl MemoryWallet {
    /// Empty wallet
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored credential by wallet id
    pub fn credential(&self, credential_id: &str) -> Option<Credential> {
        self.read().credentials.get(credential_id).cloned()
    }

    /// Number of stored credentials
    pub fn len(&self) -> usize {
        self.read().credentials.len()
    }

    /// No credentials stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of credentials this wallet has issued
    pub fn issued_len(&self) -> usize {
        self.read().issued.len()
    }

    fn read(&self) -> MutexGuard<'_, Contents> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<MutexGuard<'_, Contents>, WalletError> {
        self.contents.lock().map_err(|_| WalletError::Storage("wallet lock poisoned".into()))
    }
}

#[async_trait]
impl Wallet for MemoryWallet {
    async fn create_did(&self) -> Result<Did, WalletError> {
        format!("did:peer:{}", Uuid::new_v4().simple())
            .parse()
            .map_err(|e: didcomm_proto::ProtocolError| WalletError::DidCreation(e.to_string()))
    }

    async fn sign_offer(
        &self,
        schema_id: &str,
        _attributes: &Attributes,
    ) -> Result<Value, WalletError> {
        Ok(json!({ "schema_id": schema_id, "nonce": Uuid::new_v4().to_string() }))
    }

    async fn issue_credential(
        &self,
        exchange: ExchangeId,
        issuer: &Did,
        subject: &Did,
        schema_id: &str,
        attributes: &Attributes,
    ) -> Result<Credential, WalletError> {
        let mut contents = self.write()?;
        let credential = contents.issued.entry(exchange).or_insert_with(|| {
            let id = Uuid::new_v4().to_string();
            let proof = json!({ "type": PROOF_TYPE, "issuer": issuer.as_str(), "credential": id });
            Credential {
                id,
                schema_id: schema_id.to_string(),
                issuer: issuer.clone(),
                subject: subject.clone(),
                attributes: attributes.clone(),
                proof,
            }
        });
        Ok(credential.clone())
    }

    async fn verify(&self, credential: &Credential) -> Result<(), WalletError> {
        let proof = &credential.proof;
        if proof["type"] != PROOF_TYPE {
            return Err(WalletError::Verification("unknown proof type".into()));
        }
        if proof["issuer"] != credential.issuer.as_str() || proof["credential"] != credential.id {
            return Err(WalletError::Verification("proof does not match credential".into()));
        }
        Ok(())
    }

    async fn store_credential(&self, credential: &Credential) -> Result<String, WalletError> {
        let mut contents = self.write()?;
        if let Some(existing) = contents.stored.get(&credential.id) {
            return Ok(existing.clone());
        }

        let credential_id = format!("cred-{}", Uuid::new_v4().simple());
        contents.stored.insert(credential.id.clone(), credential_id.clone());
        contents.credentials.insert(credential_id.clone(), credential.clone());
        Ok(credential_id)
    }

    async fn present(
        &self,
        schema_id: &str,
        requested: &BTreeSet<String>,
    ) -> Result<Credential, WalletError> {
        let contents = self.read();
        let mut candidates: Vec<&Credential> = contents
            .credentials
            .values()
            .filter(|c| c.schema_id == schema_id)
            .filter(|c| requested.iter().all(|name| c.attributes.contains_key(name)))
            .collect();
        // HashMap order is arbitrary; pick deterministically.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
            .first()
            .map(|c| (*c).clone())
            .ok_or_else(|| WalletError::NoMatchingCredential(schema_id.to_string()))
    }
}
