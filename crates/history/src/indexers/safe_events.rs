//! Events-mode indexer. Chains whose Safe singletons emit the L2 event set
//! do not need traces: every state change arrives as a log, which this
//! indexer converts into synthetic decoded calls for the replay queue.

use {
    super::{BlockRange, IndexError, Indexer, decode_event, store_chain_context},
    crate::conv,
    alloy_primitives::{Address, B256, U256},
    alloy_rpc_types::{Filter, Log},
    alloy_sol_types::{SolEvent, SolValue},
    anyhow::Result,
    contracts::{ISafe, IProxyFactoryV130},
    database::{internal_txs, safes},
    ethrpc::Rpc,
    itertools::Itertools,
    serde_json::{Value, json},
    sqlx::PgPool,
    std::collections::{HashMap, HashSet},
};

pub struct SafeEventsIndexer {
    pool: PgPool,
    rpc: Rpc,
}

impl SafeEventsIndexer {
    pub fn new(pool: PgPool, rpc: Rpc) -> Self {
        Self { pool, rpc }
    }
}

/// A decoded call synthesized from events instead of traces. The log index
/// doubles as the trace address, which keeps the queue's in-transaction
/// ordering.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SyntheticCall {
    pub safe: Address,
    pub function_name: &'static str,
    pub arguments: Value,
    pub log_index: u64,
}

fn addr(value: Address) -> Value {
    Value::String(value.to_string())
}

fn uint(value: U256) -> Value {
    Value::String(value.to_string())
}

/// Converts the logs of one transaction, in log order. Pairing state lives
/// within the transaction: a `SafeMultiSigTransaction` takes its outcome
/// from the next `ExecutionSuccess`/`ExecutionFailure` of the same Safe, a
/// `SafeModuleTransaction` from the next module outcome event, and a
/// `SafeSetup` takes its singleton from the transaction's `ProxyCreation`.
/// Only creations emitted by a configured factory count; anyone can emit a
/// log with the right shape.
pub(crate) fn convert_tx_logs(logs: &[&Log], factories: &HashSet<Address>) -> Vec<SyntheticCall> {
    // singletons by created proxy
    let singletons: HashMap<Address, Address> = logs
        .iter()
        .filter(|log| factories.contains(&log.inner.address))
        .filter_map(|log| {
            let event = decode_event::<IProxyFactoryV130::ProxyCreation>(log)?;
            Some((event.proxy, event.singleton))
        })
        .collect();

    let mut calls = Vec::new();
    for (position, log) in logs.iter().enumerate() {
        let safe = log.inner.address;
        let Some(log_index) = log.log_index else {
            continue;
        };
        let Some(event) = decode_safe_event(log) else {
            continue;
        };
        let (function_name, arguments) = match event {
            SafeEvent::Setup(setup) => (
                "setup",
                json!({
                    "owners": setup.owners.iter().copied().map(addr).collect::<Vec<_>>(),
                    "threshold": uint(setup.threshold),
                    "to": addr(setup.initializer),
                    "data": "0x",
                    "fallbackHandler": addr(setup.fallbackHandler),
                    "singleton": singletons.get(&safe).copied().map(addr).unwrap_or(Value::Null),
                }),
            ),
            SafeEvent::AddedOwner(event) => (
                "addOwnerWithThreshold",
                json!({ "owner": addr(event.owner), "threshold": Value::Null }),
            ),
            SafeEvent::RemovedOwner(event) => (
                "removeOwner",
                json!({
                    "prevOwner": Value::Null,
                    "owner": addr(event.owner),
                    "threshold": Value::Null,
                }),
            ),
            SafeEvent::ChangedThreshold(event) => (
                "changeThreshold",
                json!({ "threshold": uint(event.threshold) }),
            ),
            SafeEvent::ChangedMasterCopy(event) => (
                "changeMasterCopy",
                json!({ "masterCopy": addr(event.masterCopy) }),
            ),
            SafeEvent::ChangedFallbackHandler(event) => (
                "setFallbackHandler",
                json!({ "handler": addr(event.handler) }),
            ),
            SafeEvent::ChangedGuard(event) => ("setGuard", json!({ "guard": addr(event.guard) })),
            SafeEvent::EnabledModule(event) => {
                ("enableModule", json!({ "module": addr(event.module) }))
            }
            SafeEvent::DisabledModule(event) => (
                "disableModule",
                json!({ "prevModule": Value::Null, "module": addr(event.module) }),
            ),
            SafeEvent::ApproveHash(event) => (
                "approveHash",
                json!({
                    "hashToApprove": event.approvedHash.to_string(),
                    "owner": addr(event.owner),
                }),
            ),
            SafeEvent::MultiSigTransaction(event) => {
                let nonce = decode_additional_info(&event.additionalInfo);
                let failed = execution_outcome(logs, position, safe);
                (
                    "execTransaction",
                    json!({
                        "to": addr(event.to),
                        "value": uint(event.value),
                        "data": format!("0x{}", hex::encode(&event.data)),
                        "operation": event.operation,
                        "safeTxGas": uint(event.safeTxGas),
                        "baseGas": uint(event.baseGas),
                        "gasPrice": uint(event.gasPrice),
                        "gasToken": addr(event.gasToken),
                        "refundReceiver": addr(event.refundReceiver),
                        "signatures": format!("0x{}", hex::encode(&event.signatures)),
                        "nonce": nonce.map(uint).unwrap_or(Value::Null),
                        "failed": failed.map(Value::Bool).unwrap_or(Value::Null),
                    }),
                )
            }
            SafeEvent::ModuleTransaction(event) => {
                let success = module_outcome(logs, position, safe);
                (
                    "execTransactionFromModule",
                    json!({
                        "module": addr(event.module),
                        "to": addr(event.to),
                        "value": uint(event.value),
                        "data": format!("0x{}", hex::encode(&event.data)),
                        "operation": event.operation,
                        "success": success.map(Value::Bool).unwrap_or(Value::Null),
                    }),
                )
            }
        };
        calls.push(SyntheticCall {
            safe,
            function_name,
            arguments,
            log_index,
        });
    }
    calls
}

enum SafeEvent {
    Setup(ISafe::SafeSetup),
    AddedOwner(ISafe::AddedOwner),
    RemovedOwner(ISafe::RemovedOwner),
    ChangedThreshold(ISafe::ChangedThreshold),
    ChangedMasterCopy(ISafe::ChangedMasterCopy),
    ChangedFallbackHandler(ISafe::ChangedFallbackHandler),
    ChangedGuard(ISafe::ChangedGuard),
    EnabledModule(ISafe::EnabledModule),
    DisabledModule(ISafe::DisabledModule),
    ApproveHash(ISafe::ApproveHash),
    MultiSigTransaction(ISafe::SafeMultiSigTransaction),
    ModuleTransaction(ISafe::SafeModuleTransaction),
}

fn decode_safe_event(log: &Log) -> Option<SafeEvent> {
    let topic0 = log.inner.topics().first()?;
    let event = match *topic0 {
        t if t == ISafe::SafeSetup::SIGNATURE_HASH => SafeEvent::Setup(decode_event(log)?),
        t if t == ISafe::AddedOwner::SIGNATURE_HASH => SafeEvent::AddedOwner(decode_event(log)?),
        t if t == ISafe::RemovedOwner::SIGNATURE_HASH => {
            SafeEvent::RemovedOwner(decode_event(log)?)
        }
        t if t == ISafe::ChangedThreshold::SIGNATURE_HASH => {
            SafeEvent::ChangedThreshold(decode_event(log)?)
        }
        t if t == ISafe::ChangedMasterCopy::SIGNATURE_HASH => {
            SafeEvent::ChangedMasterCopy(decode_event(log)?)
        }
        t if t == ISafe::ChangedFallbackHandler::SIGNATURE_HASH => {
            SafeEvent::ChangedFallbackHandler(decode_event(log)?)
        }
        t if t == ISafe::ChangedGuard::SIGNATURE_HASH => {
            SafeEvent::ChangedGuard(decode_event(log)?)
        }
        t if t == ISafe::EnabledModule::SIGNATURE_HASH => {
            SafeEvent::EnabledModule(decode_event(log)?)
        }
        t if t == ISafe::DisabledModule::SIGNATURE_HASH => {
            SafeEvent::DisabledModule(decode_event(log)?)
        }
        t if t == ISafe::ApproveHash::SIGNATURE_HASH => SafeEvent::ApproveHash(decode_event(log)?),
        t if t == ISafe::SafeMultiSigTransaction::SIGNATURE_HASH => {
            SafeEvent::MultiSigTransaction(decode_event(log)?)
        }
        t if t == ISafe::SafeModuleTransaction::SIGNATURE_HASH => {
            SafeEvent::ModuleTransaction(decode_event(log)?)
        }
        _ => return None,
    };
    Some(event)
}

/// `additionalInfo` is `abi.encode(nonce, msg.sender, threshold)`.
fn decode_additional_info(data: &[u8]) -> Option<U256> {
    let (nonce, _sender, _threshold) = <(U256, Address, U256)>::abi_decode(data).ok()?;
    Some(nonce)
}

/// The execution outcome of the `SafeMultiSigTransaction` at `position`:
/// the next ExecutionSuccess/ExecutionFailure the same Safe emits.
fn execution_outcome(logs: &[&Log], position: usize, safe: Address) -> Option<bool> {
    logs[position + 1..]
        .iter()
        .filter(|log| log.inner.address == safe)
        .find_map(|log| {
            let topic0 = log.inner.topics().first()?;
            if *topic0 == ISafe::ExecutionSuccess::SIGNATURE_HASH {
                Some(false)
            } else if *topic0 == ISafe::ExecutionFailure::SIGNATURE_HASH {
                Some(true)
            } else {
                None
            }
        })
}

fn module_outcome(logs: &[&Log], position: usize, safe: Address) -> Option<bool> {
    logs[position + 1..]
        .iter()
        .filter(|log| log.inner.address == safe)
        .find_map(|log| {
            let topic0 = log.inner.topics().first()?;
            if *topic0 == ISafe::ExecutionFromModuleSuccess::SIGNATURE_HASH {
                Some(true)
            } else if *topic0 == ISafe::ExecutionFromModuleFailure::SIGNATURE_HASH {
                Some(false)
            } else {
                None
            }
        })
}

#[async_trait::async_trait]
impl Indexer for SafeEventsIndexer {
    fn name(&self) -> &'static str {
        "safe_events"
    }

    async fn last_indexed_block(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let master_copies = safes::master_copies(&mut conn).await?;
        let cursor = master_copies
            .iter()
            .filter(|master_copy| master_copy.l2)
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
        let factories: HashSet<Address> = safes::proxy_factories(&mut conn)
            .await?
            .into_iter()
            .map(|factory| conv::address_from_db(factory.address))
            .collect();
        drop(conn);

        // Not filtered by address: the Safe set grows within the very range
        // being indexed (ProxyCreation then SafeSetup in one transaction).
        // Unknown emitters are dropped after grouping instead.
        let filter = Filter::new()
            .from_block(*range.start())
            .to_block(*range.end());
        let logs = self.rpc.logs(&filter).await?;

        // group by transaction, keep log order inside each group
        let groups: Vec<(B256, Vec<&Log>)> = logs
            .iter()
            .filter(|log| !log.removed)
            .filter_map(|log| Some((log.transaction_hash?, log)))
            .into_group_map()
            .into_iter()
            .sorted_by_key(|(_, group)| group.first().and_then(|log| log.block_number))
            .collect();

        let mut synthetic: Vec<(B256, u64, SyntheticCall)> = Vec::new();
        let mut tx_hashes = HashSet::new();
        for (tx_hash, group) in &groups {
            for call in convert_tx_logs(group, &factories) {
                // a fresh setup is only trusted when the proxy creation in
                // the same transaction came from a configured factory
                let known = known_safes.contains(&call.safe)
                    || (call.function_name == "setup" && !call.arguments["singleton"].is_null());
                if !known {
                    continue;
                }
                let Some(block_number) = group.first().and_then(|log| log.block_number) else {
                    continue;
                };
                tx_hashes.insert(*tx_hash);
                synthetic.push((*tx_hash, block_number, call));
            }
        }

        let mut transaction = self.pool.begin().await?;
        store_chain_context(&self.rpc, &mut transaction, &tx_hashes).await?;
        for (tx_hash, block_number, call) in &synthetic {
            let trace_address = call.log_index.to_string();
            // a Safe announcing itself through setup without a recorded
            // proxy creation is registered on the spot
            if call.function_name == "setup" {
                safes::insert_safe_contract(
                    &mut transaction,
                    &safes::SafeContract {
                        address: conv::db_address(call.safe),
                        ethereum_tx_hash: Some(conv::db_hash(*tx_hash)),
                        created_block_number: conv::db_block(*block_number),
                    },
                )
                .await?;
            }
            internal_txs::insert(
                &mut transaction,
                &internal_txs::InternalTx {
                    ethereum_tx_hash: conv::db_hash(*tx_hash),
                    trace_address: trace_address.clone(),
                    block_number: conv::db_block(*block_number),
                    transaction_index: 0,
                    from_address: Some(conv::db_address(call.safe)),
                    to_address: Some(conv::db_address(call.safe)),
                    value: bigdecimal::BigDecimal::from(0),
                    data: None,
                    call_type: internal_txs::CallType::Call,
                    error: None,
                    output: None,
                },
            )
            .await?;
            internal_txs::decoded::insert(
                &mut transaction,
                &internal_txs::DecodedTx {
                    ethereum_tx_hash: conv::db_hash(*tx_hash),
                    trace_address,
                    safe: conv::db_address(call.safe),
                    block_number: conv::db_block(*block_number),
                    transaction_index: 0,
                    function_name: call.function_name.to_string(),
                    arguments: call.arguments.clone(),
                    processed: false,
                },
            )
            .await?;
        }
        for master_copy in master_copies.iter().filter(|master_copy| master_copy.l2) {
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
    use {super::*, alloy_primitives::{Bytes, address}};

    fn log(safe: Address, log_index: u64, data: alloy_primitives::LogData) -> Log {
        Log {
            inner: alloy_primitives::Log {
                address: safe,
                data,
            },
            log_index: Some(log_index),
            ..Default::default()
        }
    }

    #[test]
    fn converts_setup_with_singleton_from_proxy_creation() {
        let factory = address!("a6B71E26C5e0845f74c812102Ca7114b6a896AB2");
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let singleton = address!("3E5c63644E683549055b9Be8653de26E0B4CD36E");
        let owner = address!("0000000000000000000000000000000000000001");

        let creation = IProxyFactoryV130::ProxyCreation {
            proxy: safe,
            singleton,
        };
        let setup = ISafe::SafeSetup {
            initiator: factory,
            owners: vec![owner],
            threshold: U256::from(1u64),
            initializer: Address::ZERO,
            fallbackHandler: Address::ZERO,
        };
        let logs = [
            log(factory, 0, creation.encode_log_data()),
            log(safe, 1, setup.encode_log_data()),
        ];
        let factories = HashSet::from([factory]);
        let calls = convert_tx_logs(&logs.iter().collect::<Vec<_>>(), &factories);

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "setup");
        assert_eq!(calls[0].safe, safe);
        assert_eq!(calls[0].log_index, 1);
        assert_eq!(calls[0].arguments["singleton"], singleton.to_string());
        assert_eq!(calls[0].arguments["threshold"], "1");
    }

    #[test]
    fn converts_owner_management_events() {
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let owner = address!("0000000000000000000000000000000000000003");
        let logs = [
            log(
                safe,
                0,
                ISafe::AddedOwner { owner }.encode_log_data(),
            ),
            log(
                safe,
                1,
                ISafe::ChangedThreshold {
                    threshold: U256::from(2u64),
                }
                .encode_log_data(),
            ),
        ];
        let calls = convert_tx_logs(&logs.iter().collect::<Vec<_>>(), &HashSet::new());
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function_name, "addOwnerWithThreshold");
        assert_eq!(calls[0].arguments["threshold"], Value::Null);
        assert_eq!(calls[1].function_name, "changeThreshold");
        assert_eq!(calls[1].arguments["threshold"], "2");
    }

    #[test]
    fn multisig_transaction_carries_nonce_and_outcome() {
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let additional_info =
            (U256::from(7u64), Address::repeat_byte(0x11), U256::from(1u64)).abi_encode();
        let execution = ISafe::SafeMultiSigTransaction {
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
            additionalInfo: additional_info.into(),
        };
        let failure = ISafe::ExecutionFailure {
            txHash: B256::ZERO,
            payment: U256::ZERO,
        };
        let logs = [
            log(safe, 0, execution.encode_log_data()),
            log(safe, 1, failure.encode_log_data()),
        ];
        let calls = convert_tx_logs(&logs.iter().collect::<Vec<_>>(), &HashSet::new());

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "execTransaction");
        assert_eq!(calls[0].arguments["nonce"], "7");
        assert_eq!(calls[0].arguments["failed"], true);
    }

    #[test]
    fn module_transaction_paired_with_outcome() {
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let module = address!("0000000000000000000000000000000000000077");
        let call = ISafe::SafeModuleTransaction {
            module,
            to: address!("1111111111111111111111111111111111111111"),
            value: U256::from(1u64),
            data: Bytes::new(),
            operation: 0,
        };
        let outcome = ISafe::ExecutionFromModuleSuccess { module };
        let logs = [
            log(safe, 0, call.encode_log_data()),
            log(safe, 1, outcome.encode_log_data()),
        ];
        let calls = convert_tx_logs(&logs.iter().collect::<Vec<_>>(), &HashSet::new());

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "execTransactionFromModule");
        assert_eq!(calls[0].arguments["module"], module.to_string());
        assert_eq!(calls[0].arguments["success"], true);
    }

    #[test]
    fn approve_hash_event_keeps_owner() {
        let safe = address!("aaaa00000000000000000000000000000000aaaa");
        let owner = address!("0000000000000000000000000000000000000001");
        let hash = B256::repeat_byte(0x22);
        let logs = [log(
            safe,
            3,
            ISafe::ApproveHash {
                approvedHash: hash,
                owner,
            }
            .encode_log_data(),
        )];
        let calls = convert_tx_logs(&logs.iter().collect::<Vec<_>>(), &HashSet::new());
        assert_eq!(calls[0].function_name, "approveHash");
        assert_eq!(calls[0].arguments["owner"], owner.to_string());
        assert_eq!(calls[0].arguments["hashToApprove"], hash.to_string());
    }

    #[test]
    fn unrelated_logs_are_ignored(){
        let token = address!("7777777777777777777777777777777777777777");
        let transfer = contracts::IErc20::Transfer {
            from: Address::ZERO,
            to: Address::ZERO,
            value: U256::from(1u64),
        };
        let logs = [log(token, 0, transfer.encode_log_data())];
        assert!(convert_tx_logs(&logs.iter().collect::<Vec<_>>(), &HashSet::new()).is_empty());
    }
}
