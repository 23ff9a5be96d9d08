//! Reorg detection and recovery. Detection compares stored unconfirmed
//! block hashes against the node; recovery deletes the divergent suffix and
//! rewinds every cursor and derived table in one transaction under the
//! global write lock, so indexers never observe a half-rewound database.

use {
    crate::{
        conv,
        metrics::Metrics,
        webhooks::{WebhookEvent, Webhooks},
    },
    anyhow::{Context, Result},
    database::{
        advisory_lock::AdvisoryLock,
        blocks,
        indexing_status::{self, IndexerKind},
        internal_txs::decoded,
        multisig_confirmations, multisig_transactions, safe_statuses, safes,
    },
    ethrpc::Rpc,
    sqlx::PgPool,
    strum::IntoEnumIterator,
};

/// Advisory lock key shared with the indexer ticks: holding it makes
/// rewinds atomic with respect to cursor advancement.
pub const REORG_LOCK_KEY: &str = "reorg-controller";

pub struct ReorgController {
    pool: PgPool,
    rpc: Rpc,
    webhooks: Webhooks,
    reorg_depth: u64,
    rewind_blocks: u64,
}

/// Where cursors end up after a reorg at `reorg_block`: `rewind_blocks`
/// earlier, clamped at genesis. Cursors already below are not touched (a
/// reorg never moves a cursor forward); that clamp lives in the queries.
pub fn rewind_target(reorg_block: u64, rewind_blocks: u64) -> u64 {
    reorg_block.saturating_sub(rewind_blocks)
}

impl ReorgController {
    pub fn new(
        pool: PgPool,
        rpc: Rpc,
        webhooks: Webhooks,
        reorg_depth: u64,
        rewind_blocks: u64,
    ) -> Self {
        Self {
            pool,
            rpc,
            webhooks,
            reorg_depth,
            rewind_blocks,
        }
    }

    /// One controller tick: confirm aged blocks, then compare the rest
    /// against the canonical chain and recover from the first divergence.
    pub async fn run_once(&self) -> Result<Option<u64>> {
        let Some(lock) = AdvisoryLock::try_acquire(&self.pool, REORG_LOCK_KEY).await? else {
            tracing::debug!("reorg controller already running elsewhere");
            return Ok(None);
        };
        let result = self.check_and_recover().await;
        lock.release().await;
        result
    }

    async fn check_and_recover(&self) -> Result<Option<u64>> {
        let head = self.rpc.block_number().await.context("current head")?;

        let mut conn = self.pool.acquire().await?;
        let confirmed = blocks::confirm_up_to(
            &mut conn,
            conv::db_block(head),
            conv::db_block(self.reorg_depth),
        )
        .await?;
        if confirmed > 0 {
            tracing::debug!(count = confirmed, "blocks confirmed");
        }

        let unconfirmed = blocks::unconfirmed(&mut conn, 1_000).await?;
        drop(conn);

        let mut divergent: Option<u64> = None;
        for stored in &unconfirmed {
            let number = stored.number.unsigned_abs();
            let canonical = self
                .rpc
                .block(number)
                .await
                .context("canonical block fetch")?;
            let matches = canonical
                .as_ref()
                .is_some_and(|header| conv::db_hash(header.hash) == stored.block_hash);
            if !matches {
                divergent = Some(number);
                break;
            }
        }

        let Some(reorg_block) = divergent else {
            return Ok(None);
        };
        tracing::warn!(reorg_block, "chain reorganization detected");
        Metrics::get().reorgs.inc();
        self.recover(reorg_block).await?;
        self.webhooks.enqueue(WebhookEvent::ReorgDetected {
            block_number: reorg_block,
        });
        Ok(Some(reorg_block))
    }

    /// Rewinds all derived state for a reorg at `reorg_block`. A single
    /// database transaction: either the whole rewind lands or none of it.
    pub async fn recover(&self, reorg_block: u64) -> Result<()> {
        let target = rewind_target(reorg_block, self.rewind_blocks);
        let reorg_db = conv::db_block(reorg_block);
        let target_db = conv::db_block(target);
        let mut transaction = self.pool.begin().await?;

        // executions pointing into the rewound range lose their tx binding
        // but keep the proposal fields
        let detached =
            multisig_transactions::detach_executions_from_block(&mut transaction, reorg_db)
                .await?;
        if !detached.is_empty() {
            multisig_confirmations::delete_onchain_for_transactions(&mut transaction, &detached)
                .await?;
            tracing::info!(count = detached.len(), "executions detached by reorg");
        }

        // snapshots derived from calls in the rewind window go away and the
        // surviving decoded calls replay again
        let affected_safes = safe_statuses::delete_from_block(&mut transaction, target_db).await?;
        safe_statuses::last::delete_many(&mut transaction, &affected_safes).await?;
        decoded::reset_from_block(&mut transaction, target_db).await?;

        // blocks last: cascades transactions, traces and transfers
        let deleted = blocks::delete_from(&mut transaction, reorg_db).await?;

        // cursors clamp down to the rewind target, never up
        safes::rewind_cursors(
            &mut transaction,
            safes::CursorTable::ProxyFactories,
            target_db,
        )
        .await?;
        safes::rewind_cursors(
            &mut transaction,
            safes::CursorTable::MasterCopies,
            target_db,
        )
        .await?;
        for kind in IndexerKind::iter() {
            let cursor = indexing_status::get(&mut transaction, kind).await?;
            if cursor > target_db {
                indexing_status::set(&mut transaction, kind, target_db).await?;
            }
        }

        transaction.commit().await?;
        tracing::info!(
            reorg_block,
            rewind_to = target,
            deleted_blocks = deleted,
            affected_safes = affected_safes.len(),
            "reorg recovery finished"
        );
        Ok(())
    }
}
