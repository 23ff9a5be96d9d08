//! Global transfer indexer: one cursor over every `Transfer` log on the
//! chain, recording only transfers that touch a known Safe. ERC-20 and
//! ERC-721 share the event signature; the indexed token id gives ERC-721
//! logs one extra topic.

use {
    super::{BlockRange, IndexError, Indexer, store_chain_context},
    crate::{
        conv,
        webhooks::{WebhookEvent, Webhooks},
    },
    alloy_primitives::{Address, B256, U256},
    alloy_rpc_types::{Filter, Log},
    alloy_sol_types::SolEvent,
    anyhow::Result,
    contracts::IErc20,
    database::{indexing_status::IndexerKind, transfers},
    ethrpc::Rpc,
    sqlx::PgPool,
    std::collections::HashSet,
};

pub struct Erc20721Indexer {
    pool: PgPool,
    rpc: Rpc,
    start_block: u64,
    webhooks: Webhooks,
}

impl Erc20721Indexer {
    pub fn new(pool: PgPool, rpc: Rpc, start_block: u64, webhooks: Webhooks) -> Self {
        Self {
            pool,
            rpc,
            start_block,
            webhooks,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Transfer {
    Erc20 {
        token: Address,
        from: Address,
        to: Address,
        value: U256,
    },
    Erc721 {
        token: Address,
        from: Address,
        to: Address,
        token_id: U256,
    },
}

/// Partitions a `Transfer` log by topic arity. ERC-721 indexes the token
/// id, giving 4 topics against ERC-20's 3. `None` for anonymous or
/// malformed shapes.
pub(crate) fn partition_transfer(log: &Log) -> Option<Transfer> {
    let topics = log.inner.topics();
    if topics.first() != Some(&IErc20::Transfer::SIGNATURE_HASH) {
        return None;
    }
    let token = log.inner.address;
    match topics.len() {
        3 => {
            let data = &log.inner.data.data;
            if data.len() != 32 {
                return None;
            }
            Some(Transfer::Erc20 {
                token,
                from: Address::from_word(topics[1]),
                to: Address::from_word(topics[2]),
                value: U256::from_be_slice(data),
            })
        }
        4 => Some(Transfer::Erc721 {
            token,
            from: Address::from_word(topics[1]),
            to: Address::from_word(topics[2]),
            token_id: U256::from_be_bytes(topics[3].0),
        }),
        _ => None,
    }
}

impl Transfer {
    fn endpoints(&self) -> (Address, Address) {
        match self {
            Self::Erc20 { from, to, .. } | Self::Erc721 { from, to, .. } => (*from, *to),
        }
    }

    fn token(&self) -> Address {
        match self {
            Self::Erc20 { token, .. } | Self::Erc721 { token, .. } => *token,
        }
    }
}

#[async_trait::async_trait]
impl Indexer for Erc20721Indexer {
    fn name(&self) -> &'static str {
        "erc20_721_transfers"
    }

    async fn last_indexed_block(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let cursor = database::indexing_status::get(&mut conn, IndexerKind::Erc20_721Events)
            .await?
            .max(0)
            .unsigned_abs();
        Ok(cursor.max(self.start_block.saturating_sub(1)))
    }

    async fn index_range(&self, range: BlockRange) -> Result<(), IndexError> {
        let mut conn = self.pool.acquire().await?;
        let known_safes: HashSet<Address> = database::safes::safe_addresses(&mut conn)
            .await?
            .into_iter()
            .map(conv::address_from_db)
            .collect();
        let cursor_before =
            database::indexing_status::get(&mut conn, IndexerKind::Erc20_721Events).await?;
        drop(conn);

        let filter = Filter::new()
            .from_block(*range.start())
            .to_block(*range.end())
            .event_signature(IErc20::Transfer::SIGNATURE_HASH);
        let logs = self.rpc.logs(&filter).await?;

        let relevant: Vec<(&Log, Transfer)> = logs
            .iter()
            .filter(|log| !log.removed)
            .filter_map(|log| Some((log, partition_transfer(log)?)))
            .filter(|(_, transfer)| {
                let (from, to) = transfer.endpoints();
                known_safes.contains(&from) || known_safes.contains(&to)
            })
            .collect();

        let tx_hashes: HashSet<B256> = relevant
            .iter()
            .filter_map(|(log, _)| log.transaction_hash)
            .collect();

        let mut transaction = self.pool.begin().await?;
        store_chain_context(&self.rpc, &mut transaction, &tx_hashes).await?;

        for (log, transfer) in &relevant {
            let (Some(tx_hash), Some(block_number), Some(log_index)) =
                (log.transaction_hash, log.block_number, log.log_index)
            else {
                continue;
            };
            match transfer {
                Transfer::Erc20 {
                    token,
                    from,
                    to,
                    value,
                } => {
                    transfers::insert_erc20(
                        &mut transaction,
                        &transfers::Erc20Transfer {
                            ethereum_tx_hash: conv::db_hash(tx_hash),
                            log_index: conv::db_block(log_index),
                            block_number: conv::db_block(block_number),
                            token_address: conv::db_address(*token),
                            from_address: conv::db_address(*from),
                            to_address: conv::db_address(*to),
                            value: conv::db_u256(*value),
                        },
                    )
                    .await?;
                }
                Transfer::Erc721 {
                    token,
                    from,
                    to,
                    token_id,
                } => {
                    transfers::insert_erc721(
                        &mut transaction,
                        &transfers::Erc721Transfer {
                            ethereum_tx_hash: conv::db_hash(tx_hash),
                            log_index: conv::db_block(log_index),
                            block_number: conv::db_block(block_number),
                            token_address: conv::db_address(*token),
                            from_address: conv::db_address(*from),
                            to_address: conv::db_address(*to),
                            token_id: conv::db_u256(*token_id),
                        },
                    )
                    .await?;
                }
            }

            let (from, to) = transfer.endpoints();
            if known_safes.contains(&to) {
                self.webhooks.enqueue(WebhookEvent::IncomingToken {
                    safe: to,
                    token_address: transfer.token(),
                    tx_hash,
                    log_index,
                    block_number,
                });
            }
            if known_safes.contains(&from) {
                self.webhooks.enqueue(WebhookEvent::OutgoingToken {
                    safe: from,
                    token_address: transfer.token(),
                    tx_hash,
                    log_index,
                    block_number,
                });
            }
        }

        // compare-and-set so concurrent instances cannot tear the cursor
        let advanced = database::indexing_status::advance(
            &mut transaction,
            IndexerKind::Erc20_721Events,
            cursor_before,
            conv::db_block(*range.end()),
        )
        .await?;
        if !advanced && cursor_before == 0 {
            // first run, the singleton row does not exist yet
            database::indexing_status::set(
                &mut transaction,
                IndexerKind::Erc20_721Events,
                conv::db_block(*range.end()),
            )
            .await?;
        } else if !advanced {
            // another instance advanced concurrently; its write wins
            tracing::debug!("transfer cursor moved concurrently, keeping it");
        }
        transaction.commit().await.map_err(IndexError::from)
    }
}
