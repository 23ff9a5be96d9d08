pub mod block_stream;
pub mod error;
pub mod retry;
pub mod trace;

pub use {
    block_stream::{BlockInfo, CurrentBlockWatcher, current_block_stream, into_stream},
    error::RpcError,
};

use {
    alloy_consensus::{Transaction as _, TxReceipt as _},
    alloy_primitives::{Address, B256, Bytes, U256},
    alloy_provider::{DynProvider, Provider, ProviderBuilder, ext::TraceApi},
    alloy_rpc_types::{
        BlockNumberOrTag, Filter, Log, TransactionInput, TransactionRequest,
    },
    error::classify,
    std::time::Duration,
    url::Url,
};

/// A block header reduced to what the indexers store.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// A mined transaction joined with its receipt.
#[derive(Clone, Debug)]
pub struct TransactionWithReceipt {
    pub hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub gas_used: u64,
    pub success: bool,
    pub tx_type: u8,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: Option<u128>,
    pub logs: Vec<Log>,
}

/// Typed facade over the JSON-RPC node. Owns timeouts; every method returns
/// a classified [`RpcError`] so callers can decide between retrying and
/// surfacing.
#[derive(Clone)]
pub struct Rpc {
    provider: DynProvider,
    timeout: Duration,
}

impl Rpc {
    pub fn new(url: &Url, timeout: Duration) -> Self {
        let provider = ProviderBuilder::new()
            .connect_http(url.clone())
            .erased();
        Self { provider, timeout }
    }

    pub fn from_provider(provider: DynProvider, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    async fn with_timeout<T>(
        &self,
        fut: impl IntoFuture<Output = Result<T, alloy_transport::TransportError>>,
    ) -> Result<T, RpcError> {
        match tokio::time::timeout(self.timeout, fut.into_future()).await {
            Ok(result) => result.map_err(classify),
            Err(_elapsed) => Err(RpcError::Timeout),
        }
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.with_timeout(self.provider.get_block_number()).await
    }

    pub async fn block(&self, number: u64) -> Result<Option<BlockHeader>, RpcError> {
        let block = self
            .with_timeout(self.provider.get_block_by_number(BlockNumberOrTag::Number(number)))
            .await?;
        Ok(block.map(|block| BlockHeader {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
        }))
    }

    pub async fn latest_block(&self) -> Result<Option<BlockHeader>, RpcError> {
        let block = self
            .with_timeout(self.provider.get_block_by_number(BlockNumberOrTag::Latest))
            .await?;
        Ok(block.map(|block| BlockHeader {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
        }))
    }

    /// Sequential header fetch for a small range. Ranges are bounded by the
    /// adaptive block process limit, so no batching magic is needed here.
    pub async fn blocks(
        &self,
        range: std::ops::RangeInclusive<u64>,
    ) -> Result<Vec<BlockHeader>, RpcError> {
        let mut headers = Vec::with_capacity(range.clone().count());
        for number in range {
            match self.block(number).await? {
                Some(header) => headers.push(header),
                None => break,
            }
        }
        Ok(headers)
    }

    pub async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.with_timeout(self.provider.get_logs(filter)).await
    }

    pub async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionWithReceipt>, RpcError> {
        let Some(receipt) = self
            .with_timeout(self.provider.get_transaction_receipt(hash))
            .await?
        else {
            return Ok(None);
        };
        let Some(tx) = self
            .with_timeout(self.provider.get_transaction_by_hash(hash))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(TransactionWithReceipt {
            hash,
            block_number: receipt.block_number.unwrap_or_default(),
            transaction_index: receipt.transaction_index.unwrap_or_default(),
            from: tx.inner.signer(),
            to: tx.inner.to(),
            value: tx.inner.value(),
            input: tx.inner.input().clone(),
            gas_used: receipt.gas_used,
            success: receipt.status(),
            tx_type: tx.inner.tx_type() as u8,
            max_fee_per_gas: tx.inner.max_fee_per_gas(),
            max_priority_fee_per_gas: tx.inner.max_priority_fee_per_gas(),
            logs: receipt.inner.logs().to_vec(),
        }))
    }

    /// Receipts for a batch of hashes, skipping hashes the node does not
    /// know (e.g. dropped during a reorg between log fetch and receipt
    /// fetch; the next indexer pass picks the canonical state up).
    pub async fn transaction_receipts(
        &self,
        hashes: &[B256],
    ) -> Result<Vec<TransactionWithReceipt>, RpcError> {
        let futures = hashes.iter().map(|hash| self.transaction_receipt(*hash));
        let results = futures::future::try_join_all(futures).await?;
        Ok(results.into_iter().flatten().collect())
    }

    pub async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
        let request = TransactionRequest {
            to: Some(to.into()),
            input: TransactionInput::new(data),
            ..Default::default()
        };
        self.with_timeout(self.provider.call(request)).await
    }

    pub async fn code(&self, address: Address) -> Result<Bytes, RpcError> {
        self.with_timeout(self.provider.get_code_at(address)).await
    }

    pub async fn trace_block(&self, number: u64) -> Result<Vec<trace::TraceEntry>, RpcError> {
        let traces = self
            .with_timeout(self.provider.trace_block(BlockNumberOrTag::Number(number).into()))
            .await?;
        Ok(traces.iter().filter_map(trace::TraceEntry::from_localized).collect())
    }

    pub async fn trace_filter(
        &self,
        range: std::ops::RangeInclusive<u64>,
        to_addresses: &[Address],
    ) -> Result<Vec<trace::TraceEntry>, RpcError> {
        let filter = alloy_rpc_types_trace::filter::TraceFilter {
            from_block: Some((*range.start()).into()),
            to_block: Some((*range.end()).into()),
            from_address: vec![],
            to_address: to_addresses.to_vec(),
            mode: Default::default(),
            after: None,
            count: None,
        };
        let traces = self.with_timeout(self.provider.trace_filter(&filter)).await?;
        Ok(traces.iter().filter_map(trace::TraceEntry::from_localized).collect())
    }
}
