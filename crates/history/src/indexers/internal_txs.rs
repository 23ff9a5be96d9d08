//! Trace-mode indexer. Enumerates call trees touching known Safes, stores
//! every trace of the containing transactions (replay needs parent and
//! child context) and queues the decodable Safe-targeted calls.

use {
    super::{BlockRange, IndexError, Indexer, store_chain_context},
    crate::{
        conv,
        webhooks::{WebhookEvent, Webhooks},
    },
    alloy_primitives::{Address, B256},
    anyhow::Result,
    contracts::decoder::{self, DecodedCall},
    database::{internal_txs, safes},
    ethrpc::{
        Rpc,
        trace::{CallKind, TraceEntry, child_trace_address},
    },
    serde_json::Value,
    sqlx::PgPool,
    std::collections::{BTreeSet, HashMap, HashSet},
};

pub struct InternalTxIndexer {
    pool: PgPool,
    rpc: Rpc,
    webhooks: Webhooks,
}

impl InternalTxIndexer {
    pub fn new(pool: PgPool, rpc: Rpc, webhooks: Webhooks) -> Self {
        Self {
            pool,
            rpc,
            webhooks,
        }
    }
}

/// A decodable call aimed at a Safe, with the context-derived arguments the
/// calldata alone cannot provide.
#[derive(Clone, Debug)]
pub(crate) struct QueuedCall {
    pub safe: Address,
    pub function_name: &'static str,
    pub arguments: Value,
    pub trace_address: String,
}

/// Which decoded calls of one transaction's trace tree go on the replay
/// queue. Pure over the trace list; `safes` is the known Safe set.
pub(crate) fn queue_calls(traces: &[TraceEntry], safes: &HashSet<Address>) -> Vec<QueuedCall> {
    let by_path: HashMap<&str, &TraceEntry> = traces
        .iter()
        .map(|trace| (trace.trace_address.as_str(), trace))
        .collect();

    let mut queued = Vec::new();
    for trace in traces {
        let Some(to) = trace.to else { continue };
        if !safes.contains(&to) || !trace.is_decodable() {
            continue;
        }
        // the proxy's DELEGATECALL into the singleton repeats the calldata
        // of the call into the proxy; queueing both would replay twice
        if trace.kind == CallKind::DelegateCall && safes.contains(&trace.from) {
            continue;
        }
        let decoded = match decoder::decode(&trace.input) {
            Ok(DecodedCall::Known { name, arguments }) => (name, arguments),
            Ok(DecodedCall::Unknown { selector }) => {
                tracing::debug!(
                    selector = %alloy_primitives::hex::encode(selector),
                    to = %to,
                    "unknown selector on safe call"
                );
                continue;
            }
            Err(err) => {
                tracing::warn!(to = %to, error = %err, "safe calldata does not decode");
                continue;
            }
        };
        let (function_name, mut arguments) = decoded;

        match function_name {
            "setup" => {
                // the master copy is the target of the proxy's delegate
                // call right below this trace
                let child = child_trace_address(&trace.trace_address, 0);
                let singleton = by_path
                    .get(child.as_str())
                    .filter(|child| child.kind == CallKind::DelegateCall && child.from == to)
                    .and_then(|child| child.to);
                arguments["singleton"] = singleton
                    .map(|address| Value::String(address.to_string()))
                    .unwrap_or(Value::Null);
            }
            "approveHash" => {
                arguments["owner"] = Value::String(trace.from.to_string());
            }
            "execTransactionFromModule" | "execTransactionFromModuleReturnData" => {
                arguments["module"] = Value::String(trace.from.to_string());
                // returned bool is the low byte of the 32 byte output word
                let success = trace
                    .output
                    .as_ref()
                    .and_then(|output| output.get(31))
                    .map(|byte| *byte != 0);
                arguments["success"] = success.map(Value::Bool).unwrap_or(Value::Null);
            }
            "execTransaction" => {
                let success = trace
                    .output
                    .as_ref()
                    .and_then(|output| output.get(31))
                    .map(|byte| *byte != 0);
                arguments["failed"] = success.map(|s| Value::Bool(!s)).unwrap_or(Value::Null);
            }
            _ => {}
        }

        queued.push(QueuedCall {
            safe: to,
            function_name,
            arguments,
            trace_address: trace.trace_address.clone(),
        });
    }
    queued
}

#[async_trait::async_trait]
impl Indexer for InternalTxIndexer {
    fn name(&self) -> &'static str {
        "internal_txs"
    }

    async fn last_indexed_block(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let master_copies = safes::master_copies(&mut conn).await?;
        let cursor = master_copies
            .iter()
            .map(|master_copy| {
                master_copy
                    .tx_block_number
                    .unwrap_or(master_copy.initial_block_number - 1)
            })
            .min()
            .unwrap_or(0);
        Ok(cursor.max(0).unsigned_abs())
    }

    async fn index_range(&self, range: BlockRange) -> Result<(), IndexError> {
        let mut conn = self.pool.acquire().await?;
        let known_safes: HashSet<Address> = safes::safe_addresses(&mut conn)
            .await?
            .into_iter()
            .map(conv::address_from_db)
            .collect();
        let master_copies = safes::master_copies(&mut conn).await?;
        drop(conn);

        if known_safes.is_empty() {
            return self.advance(&range, &master_copies).await;
        }

        let safe_list: Vec<Address> = known_safes.iter().copied().collect();
        let matches = self.rpc.trace_filter(range.clone(), &safe_list).await?;
        if matches.is_empty() {
            return self.advance(&range, &master_copies).await;
        }

        // replay needs the full call tree of every matched transaction
        let touched_blocks: BTreeSet<u64> = matches.iter().map(|t| t.block_number).collect();
        let mut traces_by_tx: HashMap<B256, Vec<TraceEntry>> = HashMap::new();
        for block_number in touched_blocks {
            for trace in self.rpc.trace_block(block_number).await? {
                traces_by_tx
                    .entry(trace.transaction_hash)
                    .or_default()
                    .push(trace);
            }
        }
        let matched_txs: HashSet<B256> = matches.iter().map(|t| t.transaction_hash).collect();
        traces_by_tx.retain(|tx_hash, _| matched_txs.contains(tx_hash));

        let mut transaction = self.pool.begin().await?;
        store_chain_context(&self.rpc, &mut transaction, &matched_txs).await?;

        for (tx_hash, traces) in &traces_by_tx {
            for trace in traces {
                // native value movements touching a Safe notify like token
                // transfers do
                if trace.kind == CallKind::Call && !trace.value.is_zero() && trace.error.is_none()
                {
                    if trace.to.is_some_and(|to| known_safes.contains(&to)) {
                        self.webhooks.enqueue(WebhookEvent::IncomingEther {
                            safe: trace.to.unwrap_or_default(),
                            tx_hash: *tx_hash,
                            value: trace.value.to_string(),
                            block_number: trace.block_number,
                        });
                    }
                    if known_safes.contains(&trace.from) {
                        self.webhooks.enqueue(WebhookEvent::OutgoingEther {
                            safe: trace.from,
                            tx_hash: *tx_hash,
                            value: trace.value.to_string(),
                            block_number: trace.block_number,
                        });
                    }
                }
                internal_txs::insert(
                    &mut transaction,
                    &internal_txs::InternalTx {
                        ethereum_tx_hash: conv::db_hash(*tx_hash),
                        trace_address: trace.trace_address.clone(),
                        block_number: conv::db_block(trace.block_number),
                        transaction_index: conv::db_block(trace.transaction_position),
                        from_address: Some(conv::db_address(trace.from)),
                        to_address: trace.to.map(conv::db_address),
                        value: conv::db_u256(trace.value),
                        data: (!trace.input.is_empty()).then(|| trace.input.to_vec()),
                        call_type: match trace.kind {
                            CallKind::Call | CallKind::CallCode => internal_txs::CallType::Call,
                            CallKind::DelegateCall => internal_txs::CallType::DelegateCall,
                            CallKind::StaticCall => internal_txs::CallType::StaticCall,
                            CallKind::Create => internal_txs::CallType::Create,
                            CallKind::Create2 => internal_txs::CallType::Create2,
                        },
                        error: trace.error.clone(),
                        output: trace.output.as_ref().map(|output| output.to_vec()),
                    },
                )
                .await?;
            }

            for call in queue_calls(traces, &known_safes) {
                let Some(trace) = traces
                    .iter()
                    .find(|trace| trace.trace_address == call.trace_address)
                else {
                    continue;
                };
                // a setup seen before its ProxyCreation registers the Safe
                if call.function_name == "setup" {
                    safes::insert_safe_contract(
                        &mut transaction,
                        &safes::SafeContract {
                            address: conv::db_address(call.safe),
                            ethereum_tx_hash: Some(conv::db_hash(*tx_hash)),
                            created_block_number: conv::db_block(trace.block_number),
                        },
                    )
                    .await?;
                }
                internal_txs::decoded::insert(
                    &mut transaction,
                    &internal_txs::DecodedTx {
                        ethereum_tx_hash: conv::db_hash(*tx_hash),
                        trace_address: call.trace_address.clone(),
                        safe: conv::db_address(call.safe),
                        block_number: conv::db_block(trace.block_number),
                        transaction_index: conv::db_block(trace.transaction_position),
                        function_name: call.function_name.to_string(),
                        arguments: call.arguments.clone(),
                        processed: false,
                    },
                )
                .await?;
            }
        }

        for master_copy in &master_copies {
            safes::advance_cursor(
                &mut transaction,
                safes::CursorTable::MasterCopies,
                &master_copy.address,
                conv::db_block(*range.end()),
            )
            .await?;
        }
        transaction.commit().await.map_err(IndexError::from)
    }
}

impl InternalTxIndexer {
    async fn advance(
        &self,
        range: &BlockRange,
        master_copies: &[safes::SafeMasterCopy],
    ) -> Result<(), IndexError> {
        let mut transaction = self.pool.begin().await?;
        for master_copy in master_copies {
            safes::advance_cursor(
                &mut transaction,
                safes::CursorTable::MasterCopies,
                &master_copy.address,
                conv::db_block(*range.end()),
            )
            .await?;
        }
        transaction.commit().await.map_err(IndexError::from)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        alloy_primitives::{Bytes, U256, address},
        alloy_sol_types::SolCall,
        contracts::ISafe,
    };

    fn trace(
        trace_address: &str,
        kind: CallKind,
        from: Address,
        to: Address,
        input: Vec<u8>,
    ) -> TraceEntry {
        TraceEntry {
            transaction_hash: B256::repeat_byte(0x99),
            block_number: 100,
            transaction_position: 0,
            trace_address: trace_address.to_string(),
            kind,
            from,
            to: Some(to),
            value: U256::ZERO,
            input: input.into(),
            error: None,
            output: None,
        }
    }

    fn setup_input() -> Vec<u8> {
        ISafe::setupCall {
            _owners: vec![address!("0000000000000000000000000000000000000001")],
            _threshold: U256::from(1u64),
            to: Address::ZERO,
            data: Bytes::new(),
            fallbackHandler: Address::ZERO,
            paymentToken: Address::ZERO,
            payment: U256::ZERO,
            paymentReceiver: Address::ZERO,
        }
        .abi_encode()
    }

    #[test]
    fn setup_takes_singleton_from_child_delegatecall() {
        let factory = address!("a6B71E26C5e0845f74c812102Ca7114b6a896AB2");
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let singleton = address!("d9Db270c1B5E3Bd161E8c8503c55cEABeE709552");
        let traces = vec![
            trace("0", CallKind::Call, factory, safe, setup_input()),
            trace("0.0", CallKind::DelegateCall, safe, singleton, setup_input()),
        ];
        let safes = HashSet::from([safe]);

        let queued = queue_calls(&traces, &safes);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].function_name, "setup");
        assert_eq!(queued[0].trace_address, "0");
        assert_eq!(queued[0].arguments["singleton"], singleton.to_string());
    }

    #[test]
    fn delegatecall_into_singleton_is_not_queued_twice() {
        let caller = address!("0000000000000000000000000000000000000009");
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let singleton = address!("d9Db270c1B5E3Bd161E8c8503c55cEABeE709552");
        let input = ISafe::approveHashCall {
            hashToApprove: B256::repeat_byte(0x01),
        }
        .abi_encode();
        // the singleton is also in the safes set in self-call setups; the
        // delegatecall from a known safe must still be filtered
        let traces = vec![
            trace("0", CallKind::Call, caller, safe, input.clone()),
            trace("0.0", CallKind::DelegateCall, safe, singleton, input),
        ];
        let safes = HashSet::from([safe, singleton]);

        let queued = queue_calls(&traces, &safes);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].trace_address, "0");
        assert_eq!(queued[0].function_name, "approveHash");
        assert_eq!(queued[0].arguments["owner"], caller.to_string());
    }

    #[test]
    fn module_call_records_caller_and_outcome() {
        let module = address!("0000000000000000000000000000000000000077");
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let input = ISafe::execTransactionFromModuleCall {
            to: address!("1111111111111111111111111111111111111111"),
            value: U256::from(1u64),
            data: Bytes::new(),
            operation: 0,
        }
        .abi_encode();
        let mut entry = trace("0.1", CallKind::Call, module, safe, input);
        let mut output = [0u8; 32];
        output[31] = 1;
        entry.output = Some(output.to_vec().into());
        let safes = HashSet::from([safe]);

        let queued = queue_calls(&[entry], &safes);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].function_name, "execTransactionFromModule");
        assert_eq!(queued[0].arguments["module"], module.to_string());
        assert_eq!(queued[0].arguments["success"], true);
    }

    #[test]
    fn failed_traces_and_foreign_targets_are_skipped() {
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let other = address!("bbbb00000000000000000000000000000000bbbb");
        let input = ISafe::approveHashCall {
            hashToApprove: B256::repeat_byte(0x01),
        }
        .abi_encode();

        let mut reverted = trace("0", CallKind::Call, other, safe, input.clone());
        reverted.error = Some("Reverted".to_string());
        let foreign = trace("1", CallKind::Call, safe, other, input);
        let safes = HashSet::from([safe]);

        assert!(queue_calls(&[reverted, foreign], &safes).is_empty());
    }

    #[test]
    fn exec_transaction_failure_from_output() {
        let caller = address!("0000000000000000000000000000000000000009");
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let input = ISafe::execTransactionCall {
            to: address!("1111111111111111111111111111111111111111"),
            value: U256::ZERO,
            data: Bytes::new(),
            operation: 0,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            signatures: Bytes::from_static(&[0u8; 65]),
        }
        .abi_encode();
        let mut entry = trace("0", CallKind::Call, caller, safe, input);
        entry.output = Some(vec![0u8; 32].into());
        let safes = HashSet::from([safe]);

        let queued = queue_calls(&[entry], &safes);
        assert_eq!(queued[0].function_name, "execTransaction");
        assert_eq!(queued[0].arguments["failed"], true);
    }
}
