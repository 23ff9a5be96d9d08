//! Scans the configured proxy factories for `ProxyCreation` events and
//! registers the created Safes.

use {
    super::{BlockRange, IndexError, Indexer, decode_event, store_chain_context},
    crate::conv,
    alloy_primitives::{Address, B256},
    alloy_rpc_types::{Filter, Log},
    alloy_sol_types::SolEvent,
    anyhow::Result,
    contracts::{IProxyFactoryV111, IProxyFactoryV130, IProxyFactoryV141},
    database::safes,
    ethrpc::Rpc,
    sqlx::PgPool,
    std::collections::HashSet,
};

pub struct ProxyFactoryIndexer {
    pool: PgPool,
    rpc: Rpc,
}

impl ProxyFactoryIndexer {
    pub fn new(pool: PgPool, rpc: Rpc) -> Self {
        Self { pool, rpc }
    }
}

/// The proxy address and, for factory versions that emit it, the singleton
/// the new proxy points at. The event signature identifies the factory
/// version.
pub(crate) fn decode_proxy_creation(log: &Log) -> Option<(Address, Option<Address>)> {
    let topics = log.inner.topics();
    let topic0 = topics.first()?;
    if *topic0 == IProxyFactoryV111::ProxyCreation::SIGNATURE_HASH {
        let event =
            decode_event::<IProxyFactoryV111::ProxyCreation>(log)?;
        return Some((event.proxy, None));
    }
    if *topic0 == IProxyFactoryV130::ProxyCreation::SIGNATURE_HASH {
        // v1.3.0 and v1.4.1 share the topic; indexedness tells them apart
        if topics.len() == 2 {
            let event = decode_event::<IProxyFactoryV141::ProxyCreation>(log)?;
            return Some((event.proxy, Some(event.singleton)));
        }
        let event = decode_event::<IProxyFactoryV130::ProxyCreation>(log)?;
        return Some((event.proxy, Some(event.singleton)));
    }
    None
}

#[async_trait::async_trait]
impl Indexer for ProxyFactoryIndexer {
    fn name(&self) -> &'static str {
        "proxy_factories"
    }

    async fn last_indexed_block(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let factories = safes::proxy_factories(&mut conn).await?;
        let cursor = factories
            .iter()
            .map(|factory| {
                factory
                    .tx_block_number
                    // one below the deployment so the deployment block
                    // itself gets indexed
                    .unwrap_or(factory.initial_block_number - 1)
            })
            .min()
            .unwrap_or(0);
        Ok(cursor.max(0).unsigned_abs())
    }

    async fn index_range(&self, range: BlockRange) -> Result<(), IndexError> {
        let mut conn = self.pool.acquire().await?;
        let factories = safes::proxy_factories(&mut conn).await?;
        drop(conn);
        if factories.is_empty() {
            return Ok(());
        }
        let addresses: Vec<Address> = factories
            .iter()
            .map(|factory| conv::address_from_db(factory.address))
            .collect();

        let filter = Filter::new()
            .from_block(*range.start())
            .to_block(*range.end())
            .address(addresses);
        let logs = self.rpc.logs(&filter).await?;

        let created: Vec<(Address, Option<Address>, &Log)> = logs
            .iter()
            .filter(|log| !log.removed)
            .filter_map(|log| {
                decode_proxy_creation(log).map(|(proxy, singleton)| (proxy, singleton, log))
            })
            .collect();

        let tx_hashes: HashSet<B256> = created
            .iter()
            .filter_map(|(_, _, log)| log.transaction_hash)
            .collect();

        let mut transaction = self.pool.begin().await?;
        store_chain_context(&self.rpc, &mut transaction, &tx_hashes).await?;
        for (proxy, _singleton, log) in &created {
            let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number)
            else {
                continue;
            };
            tracing::debug!(proxy = %proxy, block_number, "proxy created");
            safes::insert_safe_contract(
                &mut transaction,
                &safes::SafeContract {
                    address: conv::db_address(*proxy),
                    ethereum_tx_hash: Some(conv::db_hash(tx_hash)),
                    created_block_number: conv::db_block(block_number),
                },
            )
            .await?;
        }
        for factory in &factories {
            safes::advance_cursor(
                &mut transaction,
                safes::CursorTable::ProxyFactories,
                &factory.address,
                conv::db_block(*range.end()),
            )
            .await?;
        }
        transaction.commit().await.map_err(IndexError::from)
    }
}
