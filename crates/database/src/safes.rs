use {
    crate::{Address, TransactionHash},
    sqlx::{Executor, PgConnection},
};

/// A Safe known to the service, recorded on proxy creation or on the first
/// observed `setup` call.
#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct SafeContract {
    pub address: Address,
    pub ethereum_tx_hash: Option<TransactionHash>,
    pub created_block_number: i64,
}

/// A proxy factory to scan for `ProxyCreation` events. `tx_block_number` is
/// the indexing cursor: everything up to and including it has been indexed.
#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct ProxyFactory {
    pub address: Address,
    pub initial_block_number: i64,
    pub tx_block_number: Option<i64>,
}

/// A Safe singleton (master copy) deployment. `version` drives EIP-712
/// hashing, `l2` selects the events indexing mode.
#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct SafeMasterCopy {
    pub address: Address,
    pub initial_block_number: i64,
    pub tx_block_number: Option<i64>,
    pub version: String,
    pub l2: bool,
}

pub async fn insert_safe_contract(
    ex: &mut PgConnection,
    safe: &SafeContract,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO safe_contracts (address, ethereum_tx_hash, created_block_number)
VALUES ($1, $2, $3)
ON CONFLICT (address) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(safe.address)
            .bind(safe.ethereum_tx_hash)
            .bind(safe.created_block_number),
    )
    .await?;
    Ok(())
}

pub async fn get_safe_contract(
    ex: &mut PgConnection,
    address: &Address,
) -> Result<Option<SafeContract>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT address, ethereum_tx_hash, created_block_number
FROM safe_contracts
WHERE address = $1;
    "#;
    sqlx::query_as(QUERY).bind(address).fetch_optional(ex).await
}

pub async fn safe_addresses(ex: &mut PgConnection) -> Result<Vec<Address>, sqlx::Error> {
    const QUERY: &str = "SELECT address FROM safe_contracts;";
    sqlx::query_scalar(QUERY).fetch_all(ex).await
}

pub async fn safe_count(ex: &mut PgConnection) -> Result<i64, sqlx::Error> {
    const QUERY: &str = "SELECT COUNT(*) FROM safe_contracts;";
    sqlx::query_scalar(QUERY).fetch_one(ex).await
}

pub async fn upsert_proxy_factory(
    ex: &mut PgConnection,
    factory: &ProxyFactory,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO proxy_factories (address, initial_block_number, tx_block_number)
VALUES ($1, $2, $3)
ON CONFLICT (address) DO UPDATE SET initial_block_number = EXCLUDED.initial_block_number;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(factory.address)
            .bind(factory.initial_block_number)
            .bind(factory.tx_block_number),
    )
    .await?;
    Ok(())
}

pub async fn proxy_factories(ex: &mut PgConnection) -> Result<Vec<ProxyFactory>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT address, initial_block_number, tx_block_number
FROM proxy_factories
ORDER BY address;
    "#;
    sqlx::query_as(QUERY).fetch_all(ex).await
}

pub async fn upsert_master_copy(
    ex: &mut PgConnection,
    master_copy: &SafeMasterCopy,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO safe_master_copies (address, initial_block_number, tx_block_number, version, l2)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (address) DO UPDATE
SET initial_block_number = EXCLUDED.initial_block_number,
    version = EXCLUDED.version,
    l2 = EXCLUDED.l2;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(master_copy.address)
            .bind(master_copy.initial_block_number)
            .bind(master_copy.tx_block_number)
            .bind(&master_copy.version)
            .bind(master_copy.l2),
    )
    .await?;
    Ok(())
}

pub async fn master_copies(ex: &mut PgConnection) -> Result<Vec<SafeMasterCopy>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT address, initial_block_number, tx_block_number, version, l2
FROM safe_master_copies
ORDER BY address;
    "#;
    sqlx::query_as(QUERY).fetch_all(ex).await
}

pub async fn master_copy_version(
    ex: &mut PgConnection,
    address: &Address,
) -> Result<Option<String>, sqlx::Error> {
    const QUERY: &str = "SELECT version FROM safe_master_copies WHERE address = $1;";
    sqlx::query_scalar(QUERY).bind(address).fetch_optional(ex).await
}

/// Advances a per-contract cursor. `tx_block_number` never moves backwards
/// through this function; rewinds go through [`rewind_cursors`].
pub async fn advance_cursor(
    ex: &mut PgConnection,
    table: CursorTable,
    address: &Address,
    tx_block_number: i64,
) -> Result<(), sqlx::Error> {
    let query = format!(
        r#"
UPDATE {}
SET tx_block_number = $2
WHERE address = $1
    AND (tx_block_number IS NULL OR tx_block_number <= $2);
        "#,
        table.name()
    );
    ex.execute(sqlx::query(&query).bind(address).bind(tx_block_number))
        .await?;
    Ok(())
}

/// Clamps all cursors above `block_number` down to it. Cursors already below
/// are left alone; a reorg never moves a cursor forward.
pub async fn rewind_cursors(
    ex: &mut PgConnection,
    table: CursorTable,
    block_number: i64,
) -> Result<u64, sqlx::Error> {
    let query = format!(
        r#"
UPDATE {}
SET tx_block_number = $1
WHERE tx_block_number > $1;
        "#,
        table.name()
    );
    let result = sqlx::query(&query).bind(block_number).execute(ex).await?;
    Ok(result.rows_affected())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorTable {
    ProxyFactories,
    MasterCopies,
}

impl CursorTable {
    fn name(&self) -> &'static str {
        match self {
            Self::ProxyFactories => "proxy_factories",
            Self::MasterCopies => "safe_master_copies",
        }
    }
}
