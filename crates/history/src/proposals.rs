//! Validation and persistence of client supplied proposals and
//! confirmations. Nothing here touches the chain; the authority is the
//! replayed `SafeLastStatus` plus the delegate registry, and every
//! rejection carries a stable code for the API layer to surface.

use {
    crate::{
        conv,
        processor::ReplayContext,
        webhooks::{WebhookEvent, Webhooks},
    },
    alloy_primitives::{Address, B256, Bytes, U256},
    chrono::Utc,
    database::{
        delegates, multisig_confirmations,
        multisig_confirmations::{Confirmation, SignatureType},
        multisig_transactions,
        multisig_transactions::MultisigTransaction,
        safe_statuses,
    },
    model::{
        SafeTransaction,
        safe_tx::Operation,
        signature::{self, SignatureKind},
    },
    sqlx::PgPool,
};

/// A transaction proposal as submitted by a client, hash included so the
/// server can verify the client agrees on the identity.
#[derive(Clone, Debug)]
pub struct NewProposal {
    pub safe: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: u8,
    pub safe_tx_gas: U256,
    pub base_gas: U256,
    pub gas_price: U256,
    pub gas_token: Address,
    pub refund_receiver: Address,
    pub nonce: u64,
    pub safe_tx_hash: B256,
    /// The proposing address: an owner or a registered delegate.
    pub sender: Address,
    /// The sender's signature over the hash, when the sender is an owner.
    pub signature: Option<Bytes>,
    pub origin: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("safe is not indexed")]
    UnknownSafe,
    #[error("safe transaction hash mismatch, expected {expected}")]
    HashMismatch { expected: B256 },
    #[error("unsupported operation byte {0}")]
    UnsupportedOperation(u8),
    #[error("nonce {nonce} is not above the last executed nonce {last_executed}")]
    NonceTooLow { nonce: u64, last_executed: u64 },
    #[error("sender is neither an owner nor an active delegate")]
    SenderNotAuthorized,
    #[error("transaction is not known")]
    UnknownTransaction,
    #[error("transaction was already executed")]
    AlreadyExecuted,
    #[error("signature does not parse: {0}")]
    InvalidSignature(#[from] signature::SignatureError),
    #[error("signer {0} is not an owner")]
    SignerNotOwner(Address),
    #[error("owner {0} already confirmed")]
    DuplicateConfirmation(Address),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProposalError {
    /// Stable, language independent error codes for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSafe => "UNKNOWN_SAFE",
            Self::HashMismatch { .. } => "HASH_MISMATCH",
            Self::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            Self::NonceTooLow { .. } => "NONCE_TOO_LOW",
            Self::SenderNotAuthorized => "SENDER_NOT_AUTHORIZED",
            Self::UnknownTransaction => "UNKNOWN_TRANSACTION",
            Self::AlreadyExecuted => "ALREADY_EXECUTED",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::SignerNotOwner(_) => "SIGNER_NOT_OWNER",
            Self::DuplicateConfirmation(_) => "DUPLICATE_CONFIRMATION",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<sqlx::Error> for ProposalError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

/// Builds the EIP-712 object for a proposal. Pure; shared by proposal
/// validation and tests.
pub fn proposal_transaction(proposal: &NewProposal) -> Result<SafeTransaction, ProposalError> {
    let operation = Operation::try_from(proposal.operation)
        .map_err(|_| ProposalError::UnsupportedOperation(proposal.operation))?;
    Ok(SafeTransaction {
        safe: proposal.safe,
        to: proposal.to,
        value: proposal.value,
        data: proposal.data.clone(),
        operation,
        safe_tx_gas: proposal.safe_tx_gas,
        base_gas: proposal.base_gas,
        gas_price: proposal.gas_price,
        gas_token: proposal.gas_token,
        refund_receiver: proposal.refund_receiver,
        nonce: U256::from(proposal.nonce),
    })
}

/// Owner check plus delegate fallback, pure over the loaded sets.
pub fn is_authorized(sender: Address, owners: &[Address], delegates: &[Address]) -> bool {
    owners.contains(&sender) || delegates.contains(&sender)
}

pub struct ProposalService {
    pool: PgPool,
    ctx: ReplayContext,
    webhooks: Webhooks,
}

impl ProposalService {
    pub fn new(pool: PgPool, ctx: ReplayContext, webhooks: Webhooks) -> Self {
        Self {
            pool,
            ctx,
            webhooks,
        }
    }

    /// Validates and stores a proposal. Returns the verified hash.
    pub async fn propose(&self, proposal: NewProposal) -> Result<B256, ProposalError> {
        let mut conn = self.pool.acquire().await?;
        let status = safe_statuses::last::get_or_generate(&mut conn, &conv::db_address(proposal.safe))
            .await?
            .ok_or(ProposalError::UnknownSafe)?;
        let owners: Vec<Address> = status
            .owners
            .iter()
            .copied()
            .map(conv::address_from_db)
            .collect();
        let master_copy = conv::address_from_db(status.master_copy);

        // the server recomputes the identity; a disagreeing client is
        // signing something else than it thinks
        let transaction = proposal_transaction(&proposal)?;
        let version = self.ctx.version_of(master_copy);
        let expected = transaction.hash(version, self.ctx.chain_id);
        if expected != proposal.safe_tx_hash {
            return Err(ProposalError::HashMismatch { expected });
        }

        let last_executed =
            multisig_transactions::last_executed_nonce(&mut conn, &conv::db_address(proposal.safe))
                .await?;
        if let Some(last_executed) = last_executed {
            let last_executed = last_executed.unsigned_abs();
            if proposal.nonce <= last_executed {
                return Err(ProposalError::NonceTooLow {
                    nonce: proposal.nonce,
                    last_executed,
                });
            }
        }

        let delegates: Vec<Address> = delegates::active_for_safe_and_delegators(
            &mut conn,
            &conv::db_address(proposal.safe),
            &owners.iter().copied().map(conv::db_address).collect::<Vec<_>>(),
            Utc::now(),
        )
        .await?
        .into_iter()
        .map(|delegate| conv::address_from_db(delegate.delegate))
        .collect();
        if !is_authorized(proposal.sender, &owners, &delegates) {
            return Err(ProposalError::SenderNotAuthorized);
        }

        let existing =
            multisig_transactions::get(&mut conn, &conv::db_hash(expected)).await?;
        if existing.is_none() {
            multisig_transactions::insert(
                &mut conn,
                &MultisigTransaction {
                    safe_tx_hash: conv::db_hash(expected),
                    safe: conv::db_address(proposal.safe),
                    ethereum_tx_hash: None,
                    to_address: Some(conv::db_address(proposal.to)),
                    value: conv::db_u256(proposal.value),
                    data: (!proposal.data.is_empty()).then(|| proposal.data.to_vec()),
                    operation: proposal.operation.into(),
                    safe_tx_gas: conv::db_u256(proposal.safe_tx_gas),
                    base_gas: conv::db_u256(proposal.base_gas),
                    gas_price: conv::db_u256(proposal.gas_price),
                    gas_token: (!proposal.gas_token.is_zero())
                        .then(|| conv::db_address(proposal.gas_token)),
                    refund_receiver: (!proposal.refund_receiver.is_zero())
                        .then(|| conv::db_address(proposal.refund_receiver)),
                    signatures: None,
                    nonce: conv::db_block(proposal.nonce),
                    failed: None,
                    origin: proposal.origin.clone(),
                    trusted: true,
                    banned: false,
                },
            )
            .await?;
            self.webhooks.enqueue(WebhookEvent::PendingMultisigTransaction {
                safe: proposal.safe,
                safe_tx_hash: expected,
            });
        }

        if let Some(blob) = &proposal.signature {
            self.store_confirmations(&expected, proposal.safe, &owners, blob)
                .await?;
        }
        Ok(expected)
    }

    /// Adds confirmations for an already proposed transaction.
    pub async fn confirm(
        &self,
        safe_tx_hash: B256,
        signature_blob: &[u8],
    ) -> Result<Vec<Address>, ProposalError> {
        let mut conn = self.pool.acquire().await?;
        let transaction = multisig_transactions::get(&mut conn, &conv::db_hash(safe_tx_hash))
            .await?
            .ok_or(ProposalError::UnknownTransaction)?;
        if transaction.ethereum_tx_hash.is_some() {
            return Err(ProposalError::AlreadyExecuted);
        }
        let safe = conv::address_from_db(transaction.safe);
        let status = safe_statuses::last::get_or_generate(&mut conn, &transaction.safe)
            .await?
            .ok_or(ProposalError::UnknownSafe)?;
        let owners: Vec<Address> = status
            .owners
            .iter()
            .copied()
            .map(conv::address_from_db)
            .collect();
        drop(conn);

        self.store_confirmations(&safe_tx_hash, safe, &owners, signature_blob)
            .await
    }

    /// Deletes an unexecuted proposal on behalf of an owner or delegate.
    pub async fn delete_proposal(
        &self,
        safe_tx_hash: B256,
        requester: Address,
    ) -> Result<(), ProposalError> {
        let mut conn = self.pool.acquire().await?;
        let transaction = multisig_transactions::get(&mut conn, &conv::db_hash(safe_tx_hash))
            .await?
            .ok_or(ProposalError::UnknownTransaction)?;
        if transaction.ethereum_tx_hash.is_some() {
            return Err(ProposalError::AlreadyExecuted);
        }
        let safe = conv::address_from_db(transaction.safe);
        let status = safe_statuses::last::get_or_generate(&mut conn, &transaction.safe)
            .await?
            .ok_or(ProposalError::UnknownSafe)?;
        let owners: Vec<Address> = status
            .owners
            .iter()
            .copied()
            .map(conv::address_from_db)
            .collect();
        let delegates: Vec<Address> = delegates::active_for_safe_and_delegators(
            &mut conn,
            &transaction.safe,
            &status.owners,
            Utc::now(),
        )
        .await?
        .into_iter()
        .map(|delegate| conv::address_from_db(delegate.delegate))
        .collect();
        if !is_authorized(requester, &owners, &delegates) {
            return Err(ProposalError::SenderNotAuthorized);
        }

        if multisig_transactions::delete_proposal(&mut conn, &conv::db_hash(safe_tx_hash)).await? {
            self.webhooks.enqueue(WebhookEvent::DeletedMultisigTransaction {
                safe,
                safe_tx_hash,
            });
        }
        Ok(())
    }

    async fn store_confirmations(
        &self,
        safe_tx_hash: &B256,
        safe: Address,
        owners: &[Address],
        blob: &[u8],
    ) -> Result<Vec<Address>, ProposalError> {
        let parsed = signature::parse_signatures(safe_tx_hash, blob)?;

        // validate the whole blob before writing anything
        let mut conn = self.pool.acquire().await?;
        for parsed_signature in &parsed {
            if !owners.contains(&parsed_signature.owner) {
                return Err(ProposalError::SignerNotOwner(parsed_signature.owner));
            }
            let duplicate = multisig_confirmations::exists(
                &mut conn,
                &conv::db_hash(*safe_tx_hash),
                &conv::db_address(parsed_signature.owner),
            )
            .await?;
            if duplicate {
                return Err(ProposalError::DuplicateConfirmation(parsed_signature.owner));
            }
        }

        let mut confirmed = Vec::with_capacity(parsed.len());
        for parsed_signature in &parsed {
            let (signature, signature_type) = match parsed_signature.kind {
                SignatureKind::ApprovedHash => (None, SignatureType::ApprovedHash),
                SignatureKind::Contract => (
                    Some(parsed_signature.raw.to_vec()),
                    SignatureType::ContractSignature,
                ),
                SignatureKind::EthSign => {
                    (Some(parsed_signature.raw.to_vec()), SignatureType::EthSign)
                }
                SignatureKind::Eoa => (Some(parsed_signature.raw.to_vec()), SignatureType::Eoa),
            };
            multisig_confirmations::insert(
                &mut conn,
                &Confirmation {
                    multisig_transaction_hash: conv::db_hash(*safe_tx_hash),
                    owner: conv::db_address(parsed_signature.owner),
                    ethereum_tx_hash: None,
                    signature,
                    signature_type,
                },
            )
            .await?;
            self.webhooks.enqueue(WebhookEvent::NewConfirmation {
                safe,
                safe_tx_hash: *safe_tx_hash,
                owner: parsed_signature.owner,
                block_number: 0,
            });
            confirmed.push(parsed_signature.owner);
        }
        Ok(confirmed)
    }
}
