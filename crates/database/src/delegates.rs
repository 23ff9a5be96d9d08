use {
    crate::Address,
    chrono::{DateTime, Utc},
    sqlx::{Executor, PgConnection},
};

/// An address authorized by an owner to propose transactions on the owner's
/// behalf. Either scoped to one Safe or global (`safe` is null).
#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct Delegate {
    pub safe: Option<Address>,
    pub delegator: Address,
    pub delegate: Address,
    pub label: String,
    pub expiry: Option<DateTime<Utc>>,
}

pub async fn upsert(ex: &mut PgConnection, delegate: &Delegate) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO safe_contract_delegates (safe, delegator, delegate, label, expiry)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (COALESCE(safe, '\x00000000000000000000000000000000000000ff'::bytea), delegator, delegate)
DO UPDATE SET label = EXCLUDED.label, expiry = EXCLUDED.expiry;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(delegate.safe)
            .bind(delegate.delegator)
            .bind(delegate.delegate)
            .bind(&delegate.label)
            .bind(delegate.expiry),
    )
    .await?;
    Ok(())
}

pub async fn remove(
    ex: &mut PgConnection,
    safe: &Option<Address>,
    delegator: &Address,
    delegate: &Address,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
DELETE FROM safe_contract_delegates
WHERE safe IS NOT DISTINCT FROM $1 AND delegator = $2 AND delegate = $3;
    "#;
    let result = sqlx::query(QUERY)
        .bind(safe)
        .bind(delegator)
        .bind(delegate)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Active (unexpired) delegates authorized by any of the given delegators
/// for the Safe. Global delegations apply to every Safe; expired rows are
/// filtered, not deleted.
pub async fn active_for_safe_and_delegators(
    ex: &mut PgConnection,
    safe: &Address,
    delegators: &[Address],
    now: DateTime<Utc>,
) -> Result<Vec<Delegate>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT safe, delegator, delegate, label, expiry
FROM safe_contract_delegates
WHERE (safe = $1 OR safe IS NULL)
    AND delegator = ANY($2)
    AND (expiry IS NULL OR expiry > $3)
ORDER BY delegate;
    "#;
    sqlx::query_as(QUERY)
        .bind(safe)
        .bind(delegators)
        .bind(now)
        .fetch_all(ex)
        .await
}

pub async fn for_safe(ex: &mut PgConnection, safe: &Address) -> Result<Vec<Delegate>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT safe, delegator, delegate, label, expiry
FROM safe_contract_delegates
WHERE safe = $1 OR safe IS NULL
ORDER BY delegate;
    "#;
    sqlx::query_as(QUERY).bind(safe).fetch_all(ex).await
}
