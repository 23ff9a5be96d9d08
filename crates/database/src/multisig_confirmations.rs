use {
    crate::{Address, PgTransaction, SafeTxHash, TransactionHash},
    sqlx::{Executor, PgConnection},
};

/// How an owner attested to a Safe transaction. Stored as `smallint`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[repr(i16)]
pub enum SignatureType {
    #[default]
    ContractSignature = 0,
    ApprovedHash = 1,
    EthSign = 2,
    Eoa = 3,
}

/// One owner's confirmation of a Safe transaction. At most one per
/// (transaction, owner). Confirmations may exist before the transaction row
/// does; they join on the hash.
#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct Confirmation {
    pub multisig_transaction_hash: SafeTxHash,
    pub owner: Address,
    /// Set when the confirmation was derived from chain data (an
    /// `approveHash` call or signatures of an execution). Such rows die with
    /// the transaction on reorg; off-chain rows have no tx and survive.
    pub ethereum_tx_hash: Option<TransactionHash>,
    pub signature: Option<Vec<u8>>,
    pub signature_type: SignatureType,
}

pub async fn insert(ex: &mut PgConnection, confirmation: &Confirmation) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO multisig_confirmations (
    multisig_transaction_hash, owner, ethereum_tx_hash, signature,
    signature_type
)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (multisig_transaction_hash, owner) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(confirmation.multisig_transaction_hash)
            .bind(confirmation.owner)
            .bind(confirmation.ethereum_tx_hash)
            .bind(&confirmation.signature)
            .bind(confirmation.signature_type),
    )
    .await?;
    Ok(())
}

pub async fn for_transaction(
    ex: &mut PgConnection,
    safe_tx_hash: &SafeTxHash,
) -> Result<Vec<Confirmation>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT multisig_transaction_hash, owner, ethereum_tx_hash, signature,
    signature_type
FROM multisig_confirmations
WHERE multisig_transaction_hash = $1
ORDER BY owner;
    "#;
    sqlx::query_as(QUERY).bind(safe_tx_hash).fetch_all(ex).await
}

pub async fn exists(
    ex: &mut PgConnection,
    safe_tx_hash: &SafeTxHash,
    owner: &Address,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
SELECT EXISTS (
    SELECT 1
    FROM multisig_confirmations
    WHERE multisig_transaction_hash = $1 AND owner = $2
);
    "#;
    sqlx::query_scalar(QUERY)
        .bind(safe_tx_hash)
        .bind(owner)
        .fetch_one(ex)
        .await
}

/// Removes chain-derived confirmations of the given transactions. Used by
/// the reorg rewind after executions were detached; off-chain confirmations
/// (no ethereum tx) are kept.
pub async fn delete_onchain_for_transactions(
    ex: &mut PgTransaction<'_>,
    safe_tx_hashes: &[SafeTxHash],
) -> Result<u64, sqlx::Error> {
    const QUERY: &str = r#"
DELETE FROM multisig_confirmations
WHERE multisig_transaction_hash = ANY($1) AND ethereum_tx_hash IS NOT NULL;
    "#;
    let result = sqlx::query(QUERY)
        .bind(safe_tx_hashes)
        .execute(&mut **ex)
        .await?;
    Ok(result.rows_affected())
}
