pub mod advisory_lock;
pub mod blocks;
pub mod byte_array;
pub mod delegates;
pub mod indexing_status;
pub mod internal_txs;
pub mod module_transactions;
pub mod multisig_confirmations;
pub mod multisig_transactions;
pub mod safe_statuses;
pub mod safes;
pub mod transactions;
pub mod transfers;

use {
    bigdecimal::{BigDecimal, num_bigint::BigInt},
    byte_array::ByteArray,
    sqlx::{Executor, PgPool},
};

// Design:
//
// Functions that execute multiple statements take `&mut PgTransaction` to
// indicate this and to ensure the whole function succeeds or fails together.
// Functions that execute a single statement take `&mut PgConnection`. The
// parameter is called `ex` for `Executor`, the trait whose methods run the
// queries. `PgTransaction` derefs to `PgConnection` so callers decide whether
// a function participates in a bigger transaction or runs standalone; they
// are responsible for calling `commit`.
//
// For tests a useful pattern is to begin a transaction at the start of the
// test, run every query on it and never commit. Dropping the uncommitted
// transaction rolls it back, which lets postgres tests run in parallel
// without clearing tables first.

pub type PgTransaction<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

/// The names of all tables we use in the db.
pub const ALL_TABLES: &[&str] = &[
    "blocks",
    "transactions",
    "internal_txs",
    "internal_txs_decoded",
    "erc20_transfers",
    "erc721_transfers",
    "safe_contracts",
    "proxy_factories",
    "safe_master_copies",
    "safe_statuses",
    "safe_last_statuses",
    "multisig_transactions",
    "multisig_confirmations",
    "module_transactions",
    "safe_contract_delegates",
    "indexing_status",
];

/// Delete all data in the database. Only used by tests.
#[allow(non_snake_case)]
pub async fn clear_DANGER_(ex: &mut PgTransaction<'_>) -> sqlx::Result<()> {
    for table in ALL_TABLES {
        ex.execute(format!("TRUNCATE {table} CASCADE;").as_str())
            .await?;
    }
    Ok(())
}

/// Like above but more ergonomic for tests that use a pool.
#[allow(non_snake_case)]
pub async fn clear_DANGER(pool: &PgPool) -> sqlx::Result<()> {
    let mut transaction = pool.begin().await?;
    clear_DANGER_(&mut transaction).await?;
    transaction.commit().await
}

pub type Address = ByteArray<20>;
pub type TransactionHash = ByteArray<32>;
pub type SafeTxHash = ByteArray<32>;

/// Converts a 256 bit unsigned integer in big endian bytes into the
/// `numeric(78, 0)` representation postgres stores it as.
pub fn u256_to_big_decimal(big_endian: &[u8; 32]) -> BigDecimal {
    let bigint = BigInt::from_bytes_be(bigdecimal::num_bigint::Sign::Plus, big_endian);
    BigDecimal::new(bigint, 0)
}

/// The inverse of [`u256_to_big_decimal`]. `None` if the value is negative,
/// fractional or does not fit in 256 bits.
pub fn big_decimal_to_u256(value: &BigDecimal) -> Option<[u8; 32]> {
    if !value.is_integer() {
        return None;
    }
    // scale 0 keeps the digits exact; normalizing would move trailing
    // zeros into the exponent
    let (bigint, _exponent) = value.with_scale(0).into_bigint_and_exponent();
    let (sign, bytes) = bigint.to_bytes_be();
    if sign == bigdecimal::num_bigint::Sign::Minus || bytes.len() > 32 {
        return None;
    }
    let mut result = [0u8; 32];
    result[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(result)
}
