//! Delegate registry: owners authorize addresses to propose (never to
//! execute) on their behalf, optionally scoped to one Safe and optionally
//! expiring. Authentication of the registration call itself is the API
//! layer's concern.

use {
    crate::conv,
    alloy_primitives::Address,
    anyhow::Result,
    chrono::{DateTime, Utc},
    database::{delegates, safe_statuses},
    sqlx::PgPool,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("delegator is not an owner of the safe")]
    DelegatorNotOwner,
    #[error("expiry is in the past")]
    ExpiryInPast,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for DelegateError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

pub struct DelegateRegistry {
    pool: PgPool,
}

impl DelegateRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Registers (or refreshes) a delegation. For Safe-scoped delegations
    /// the delegator must currently own the Safe; global delegations have
    /// no such anchor and are accepted as-is.
    pub async fn add(
        &self,
        safe: Option<Address>,
        delegator: Address,
        delegate: Address,
        label: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), DelegateError> {
        if let Some(expiry) = expiry
            && expiry <= Utc::now()
        {
            return Err(DelegateError::ExpiryInPast);
        }
        let mut conn = self.pool.acquire().await?;
        if let Some(safe) = safe {
            let owns = safe_statuses::last::get(&mut conn, &conv::db_address(safe))
                .await?
                .is_some_and(|status| status.owners.contains(&conv::db_address(delegator)));
            if !owns {
                return Err(DelegateError::DelegatorNotOwner);
            }
        }
        delegates::upsert(
            &mut conn,
            &delegates::Delegate {
                safe: safe.map(conv::db_address),
                delegator: conv::db_address(delegator),
                delegate: conv::db_address(delegate),
                label: label.to_string(),
                expiry,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove(
        &self,
        safe: Option<Address>,
        delegator: Address,
        delegate: Address,
    ) -> Result<bool, DelegateError> {
        let mut conn = self.pool.acquire().await?;
        Ok(delegates::remove(
            &mut conn,
            &safe.map(conv::db_address),
            &conv::db_address(delegator),
            &conv::db_address(delegate),
        )
        .await?)
    }

    /// Every delegation visible to a Safe, expired ones included; callers
    /// that authorize proposals use the filtered database query instead.
    pub async fn list(&self, safe: Address) -> Result<Vec<delegates::Delegate>, DelegateError> {
        let mut conn = self.pool.acquire().await?;
        Ok(delegates::for_safe(&mut conn, &conv::db_address(safe)).await?)
    }
}
