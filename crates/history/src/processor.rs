//! Replay of decoded Safe calls into configuration snapshots. The
//! transition function is pure; the surrounding processor streams each
//! Safe's queue under an advisory lock and turns the effects into rows.

use {
    crate::{
        calls::{self, ExecArgs, SafeCall},
        conv,
        metrics::Metrics,
        webhooks::{WebhookEvent, Webhooks},
    },
    alloy_primitives::{Address, B256, Bytes},
    anyhow::{Context, Result},
    database::{
        advisory_lock::AdvisoryLock,
        internal_txs::{DecodedTx, decoded},
        multisig_confirmations::{self, Confirmation, SignatureType},
        multisig_transactions::{self, MultisigTransaction},
        module_transactions::{self, ModuleTransaction},
        safe_statuses::{self, SafeStatus},
    },
    model::{
        SafeTransaction, SafeVersion,
        safe_tx::Operation,
        signature::{self, SignatureKind},
    },
    sqlx::PgPool,
    std::collections::{HashMap, HashSet},
};

/// The live configuration of one Safe during replay.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SafeState {
    pub address: Address,
    pub nonce: u64,
    pub owners: Vec<Address>,
    pub threshold: u64,
    pub master_copy: Address,
    pub fallback_handler: Address,
    pub guard: Option<Address>,
    pub enabled_modules: Vec<Address>,
}

impl SafeState {
    fn from_db(status: &SafeStatus) -> Self {
        Self {
            address: conv::address_from_db(status.address),
            nonce: status.nonce.max(0) as u64,
            owners: status.owners.iter().copied().map(conv::address_from_db).collect(),
            threshold: status.threshold.max(0) as u64,
            master_copy: conv::address_from_db(status.master_copy),
            fallback_handler: conv::address_from_db(status.fallback_handler),
            guard: status.guard.map(conv::address_from_db),
            enabled_modules: status
                .enabled_modules
                .iter()
                .copied()
                .map(conv::address_from_db)
                .collect(),
        }
    }

    fn to_db(&self, row: &DecodedTx) -> SafeStatus {
        SafeStatus {
            address: conv::db_address(self.address),
            ethereum_tx_hash: row.ethereum_tx_hash,
            trace_address: row.trace_address.clone(),
            block_number: row.block_number,
            nonce: conv::db_block(self.nonce),
            owners: self.owners.iter().copied().map(conv::db_address).collect(),
            threshold: conv::db_block(self.threshold),
            master_copy: conv::db_address(self.master_copy),
            fallback_handler: conv::db_address(self.fallback_handler),
            guard: self.guard.map(conv::db_address),
            enabled_modules: self
                .enabled_modules
                .iter()
                .copied()
                .map(conv::db_address)
                .collect(),
        }
    }
}

/// Master copy metadata the replay needs to hash executions.
#[derive(Clone, Debug, Default)]
pub struct ReplayContext {
    pub chain_id: u64,
    pub versions: HashMap<Address, SafeVersion>,
}

impl ReplayContext {
    /// Safes pointing at an unregistered master copy hash like 1.3.0, the
    /// version every modern deployment runs.
    pub fn version_of(&self, master_copy: Address) -> SafeVersion {
        self.versions
            .get(&master_copy)
            .copied()
            .unwrap_or(model::version::V1_3_0)
    }
}

/// Replay failures that stop a Safe's queue. The Safe stays flagged until
/// the missing data is indexed or a reindex resolves it.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("call before setup")]
    NotInitialized,
    #[error("arguments do not parse: {0}")]
    Malformed(#[from] calls::ParseError),
    #[error("replayed state disagrees with the chain: {0}")]
    Inconsistent(&'static str),
    #[error("nonce mismatch: replay at {replayed}, chain says {observed}")]
    NonceMismatch { replayed: u64, observed: u64 },
}

/// An `execTransaction` observed on chain, ready for reconciliation with a
/// possibly pre-existing proposal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Execution {
    pub safe_tx_hash: B256,
    pub transaction: SafeTransaction,
    pub signatures: Bytes,
    pub failed: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleExecution {
    pub module: Address,
    pub to: Address,
    pub value: alloy_primitives::U256,
    pub data: Bytes,
    pub operation: u8,
    pub success: bool,
}

/// What applying one decoded call did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    /// Configuration changed; a snapshot row is due.
    Mutated,
    /// The nonce advanced through an executed Safe transaction; a snapshot
    /// row is due and the execution reconciles against proposals.
    Executed(Box<Execution>),
    /// An on-chain `approveHash`; recorded as a confirmation.
    Approved { hash: B256, owner: Address },
    /// A module bypassed the owners; recorded as a module transaction.
    Module(Box<ModuleExecution>),
    /// No derived state changes.
    Skipped { reason: &'static str },
}

/// The pure transition. `nested` marks an `execTransaction` whose trace
/// path sits below another decoded execution of the same Safe in the same
/// transaction; only the outer one advances the nonce.
pub fn apply(
    state: &mut Option<SafeState>,
    safe: Address,
    call: &SafeCall,
    nested: bool,
    ctx: &ReplayContext,
) -> Result<Effect, ReplayError> {
    // setup is the only call that may run on an uninitialized Safe
    if let SafeCall::Setup {
        owners,
        threshold,
        fallback_handler,
        singleton,
    } = call
    {
        if state.is_some() {
            return Ok(Effect::Skipped {
                reason: "safe already initialized",
            });
        }
        *state = Some(SafeState {
            address: safe,
            nonce: 0,
            owners: owners.clone(),
            threshold: *threshold,
            master_copy: singleton.unwrap_or_default(),
            fallback_handler: fallback_handler.unwrap_or_default(),
            guard: None,
            enabled_modules: vec![],
        });
        return Ok(Effect::Mutated);
    }

    let Some(state) = state.as_mut() else {
        return Err(ReplayError::NotInitialized);
    };

    let effect = match call {
        SafeCall::Setup { .. } => unreachable!("handled above"),
        SafeCall::AddOwnerWithThreshold { owner, threshold } => {
            if !state.owners.contains(owner) {
                state.owners.push(*owner);
            }
            if let Some(threshold) = threshold {
                state.threshold = *threshold;
            }
            Effect::Mutated
        }
        SafeCall::RemoveOwner {
            prev_owner: _,
            owner,
            threshold,
        } => {
            let Some(position) = state.owners.iter().position(|o| o == owner) else {
                return Err(ReplayError::Inconsistent("removed owner was not tracked"));
            };
            state.owners.remove(position);
            if let Some(threshold) = threshold {
                state.threshold = *threshold;
            }
            Effect::Mutated
        }
        SafeCall::SwapOwner {
            prev_owner: _,
            old_owner,
            new_owner,
        } => {
            let Some(position) = state.owners.iter().position(|o| o == old_owner) else {
                return Err(ReplayError::Inconsistent("swapped owner was not tracked"));
            };
            state.owners[position] = *new_owner;
            Effect::Mutated
        }
        SafeCall::ChangeThreshold { threshold } => {
            state.threshold = *threshold;
            Effect::Mutated
        }
        SafeCall::ChangeMasterCopy { master_copy } => {
            state.master_copy = *master_copy;
            Effect::Mutated
        }
        SafeCall::SetFallbackHandler { handler } => {
            state.fallback_handler = *handler;
            Effect::Mutated
        }
        SafeCall::SetGuard { guard } => {
            state.guard = (!guard.is_zero()).then_some(*guard);
            Effect::Mutated
        }
        SafeCall::EnableModule { module } => {
            if !state.enabled_modules.contains(module) {
                state.enabled_modules.push(*module);
            }
            Effect::Mutated
        }
        SafeCall::DisableModule { module } => {
            let Some(position) = state.enabled_modules.iter().position(|m| m == module) else {
                return Err(ReplayError::Inconsistent("disabled module was not tracked"));
            };
            state.enabled_modules.remove(position);
            Effect::Mutated
        }
        SafeCall::ExecTransaction(args) => {
            if nested {
                Effect::Skipped {
                    reason: "nested execution inside an outer execTransaction",
                }
            } else {
                let nonce = match args.nonce {
                    Some(observed) => {
                        let observed =
                            u64::try_from(observed).map_err(|_| {
                                ReplayError::Inconsistent("event nonce beyond u64")
                            })?;
                        if observed != state.nonce {
                            return Err(ReplayError::NonceMismatch {
                                replayed: state.nonce,
                                observed,
                            });
                        }
                        observed
                    }
                    None => state.nonce,
                };
                let execution = build_execution(state, args, nonce, ctx)?;
                state.nonce = nonce + 1;
                Effect::Executed(Box::new(execution))
            }
        }
        SafeCall::ApproveHash { hash, owner } => match owner {
            Some(owner) => Effect::Approved {
                hash: *hash,
                owner: *owner,
            },
            None => Effect::Skipped {
                reason: "approveHash without an attributable caller",
            },
        },
        SafeCall::ExecTransactionFromModule {
            module,
            to,
            value,
            data,
            operation,
            success,
        } => match module {
            Some(module) => Effect::Module(Box::new(ModuleExecution {
                module: *module,
                to: *to,
                value: *value,
                data: data.clone(),
                operation: *operation,
                success: success.unwrap_or(true),
            })),
            None => Effect::Skipped {
                reason: "module call without caller context",
            },
        },
        SafeCall::Unknown { .. } => Effect::Skipped {
            reason: "unknown selector",
        },
    };
    Ok(effect)
}

fn build_execution(
    state: &SafeState,
    args: &ExecArgs,
    nonce: u64,
    ctx: &ReplayContext,
) -> Result<Execution, ReplayError> {
    let operation = Operation::try_from(args.operation)
        .map_err(|_| ReplayError::Inconsistent("operation byte out of range"))?;
    let transaction = SafeTransaction {
        safe: state.address,
        to: args.to,
        value: args.value,
        data: args.data.clone(),
        operation,
        safe_tx_gas: args.safe_tx_gas,
        base_gas: args.base_gas,
        gas_price: args.gas_price,
        gas_token: args.gas_token,
        refund_receiver: args.refund_receiver,
        nonce: alloy_primitives::U256::from(nonce),
    };
    let version = ctx.version_of(state.master_copy);
    let safe_tx_hash = transaction.hash(version, ctx.chain_id);
    Ok(Execution {
        safe_tx_hash,
        transaction,
        signatures: args.signatures.clone(),
        failed: args.failed.unwrap_or(false),
    })
}

/// Whether `parent` is a strict prefix of `child` in the dotted trace path
/// sense.
fn is_trace_prefix(parent: &str, child: &str) -> bool {
    if parent == child {
        return false;
    }
    parent.is_empty() || child.starts_with(&format!("{parent}."))
}

/// Reads the Safe's authoritative configuration for corruption spot checks.
#[async_trait::async_trait]
pub trait ChainReader: Send + Sync {
    async fn safe_nonce(&self, safe: Address) -> Result<u64>;
    async fn safe_threshold(&self, safe: Address) -> Result<u64>;
    async fn safe_owners(&self, safe: Address) -> Result<Vec<Address>>;
}

pub struct TxProcessor {
    pool: PgPool,
    ctx: ReplayContext,
    webhooks: Webhooks,
    chain: Option<std::sync::Arc<dyn ChainReader>>,
}

/// Advisory lock namespace for per-Safe replay.
fn replay_lock_key(safe: Address) -> String {
    format!("safe-replay-{safe}")
}

impl TxProcessor {
    pub fn new(
        pool: PgPool,
        ctx: ReplayContext,
        webhooks: Webhooks,
        chain: Option<std::sync::Arc<dyn ChainReader>>,
    ) -> Self {
        Self {
            pool,
            ctx,
            webhooks,
            chain,
        }
    }

    /// One processor tick: replays every Safe with pending decoded calls.
    pub async fn process_pending(&self) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        let safes = decoded::pending_safes(&mut conn).await?;
        drop(conn);

        let mut processed = 0;
        for safe in safes {
            let address = conv::address_from_db(safe);
            match self.process_safe(address).await {
                Ok(0) => {}
                Ok(count) => {
                    processed += count;
                    // spot check the fresh tail state against the node
                    if let Err(err) = self.verify_against_chain(address).await {
                        tracing::warn!(safe = %address, error = ?err, "chain spot check failed");
                    }
                }
                Err(err) => {
                    Metrics::get().replay_errors.inc();
                    tracing::error!(safe = %address, error = ?err, "replay stopped");
                }
            }
        }
        Ok(processed)
    }

    /// Replays one Safe's queue. Serialized across instances through an
    /// advisory lock; a held lock skips the Safe until the next tick.
    pub async fn process_safe(&self, safe: Address) -> Result<usize> {
        let Some(lock) = AdvisoryLock::try_acquire(&self.pool, &replay_lock_key(safe)).await?
        else {
            tracing::debug!(safe = %safe, "replay already running elsewhere");
            return Ok(0);
        };
        let result = self.process_safe_locked(safe).await;
        lock.release().await;
        result
    }

    async fn process_safe_locked(&self, safe: Address) -> Result<usize> {
        let safe_db = conv::db_address(safe);
        let mut transaction = self.pool.begin().await?;

        if decoded::out_of_order_for_safe(&mut transaction, &safe_db).await? {
            tracing::warn!(safe = %safe, "queue out of order, scheduling reindex");
            self.reindex_safe(&mut transaction, safe).await?;
            transaction.commit().await?;
            return Ok(0);
        }

        let pending = decoded::pending_for_safe(&mut transaction, &safe_db).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut state = safe_statuses::last::get_or_generate(&mut transaction, &safe_db)
            .await?
            .as_ref()
            .map(SafeState::from_db);

        // exec trace paths seen per transaction, for nested exec detection
        let mut exec_paths: HashMap<database::TransactionHash, Vec<String>> = HashMap::new();
        let mut processed = 0;

        for row in &pending {
            let call = match calls::parse(&row.function_name, &row.arguments) {
                Ok(call) => call,
                Err(err) => {
                    Metrics::get().replay_errors.inc();
                    tracing::error!(
                        safe = %safe,
                        function = %row.function_name,
                        error = %err,
                        "malformed decoded call, stopping replay"
                    );
                    break;
                }
            };

            let nested = matches!(call, SafeCall::ExecTransaction(_))
                && exec_paths
                    .get(&row.ethereum_tx_hash)
                    .is_some_and(|paths| {
                        paths.iter().any(|p| is_trace_prefix(p, &row.trace_address))
                    });

            let effect = match apply(&mut state, safe, &call, nested, &self.ctx) {
                Ok(effect) => effect,
                Err(ReplayError::NotInitialized) => {
                    tracing::debug!(safe = %safe, "waiting for setup to be indexed");
                    break;
                }
                Err(err) => {
                    Metrics::get().replay_errors.inc();
                    tracing::error!(safe = %safe, error = %err, "replay failed, stopping");
                    break;
                }
            };

            if matches!(call, SafeCall::ExecTransaction(_)) {
                exec_paths
                    .entry(row.ethereum_tx_hash)
                    .or_default()
                    .push(row.trace_address.clone());
            }

            match &effect {
                Effect::Mutated => {
                    let state = state.as_ref().expect("mutated state exists");
                    let status = state.to_db(row);
                    safe_statuses::insert(&mut transaction, &status).await?;
                    safe_statuses::last::upsert(&mut transaction, &status).await?;
                }
                Effect::Executed(execution) => {
                    let state = state.as_ref().expect("executed state exists");
                    let status = state.to_db(row);
                    safe_statuses::insert(&mut transaction, &status).await?;
                    safe_statuses::last::upsert(&mut transaction, &status).await?;
                    self.record_execution(&mut transaction, row, execution, state)
                        .await?;
                }
                Effect::Approved { hash, owner } => {
                    multisig_confirmations::insert(
                        &mut transaction,
                        &Confirmation {
                            multisig_transaction_hash: conv::db_hash(*hash),
                            owner: conv::db_address(*owner),
                            ethereum_tx_hash: Some(row.ethereum_tx_hash),
                            signature: None,
                            signature_type: SignatureType::ApprovedHash,
                        },
                    )
                    .await?;
                    self.webhooks.enqueue(WebhookEvent::NewConfirmation {
                        safe,
                        safe_tx_hash: *hash,
                        owner: *owner,
                        block_number: row.block_number as u64,
                    });
                }
                Effect::Module(module_execution) => {
                    self.record_module_transaction(&mut transaction, safe, row, module_execution)
                        .await?;
                }
                Effect::Skipped { reason } => {
                    tracing::debug!(
                        safe = %safe,
                        function = %row.function_name,
                        reason,
                        "decoded call skipped"
                    );
                }
            }

            decoded::set_processed(&mut transaction, &row.ethereum_tx_hash, &row.trace_address)
                .await?;
            processed += 1;
        }

        // gap detection over the snapshot series written so far
        if safe_statuses::is_corrupted(&mut transaction, &safe_db).await? {
            Metrics::get().corrupted_safes.inc();
            tracing::error!(safe = %safe, "snapshot series has nonce gaps, reindexing");
            self.reindex_safe(&mut transaction, safe).await?;
            transaction.commit().await?;
            return Ok(0);
        }

        transaction.commit().await?;
        Metrics::get().decoded_calls_processed.inc_by(processed as u64);
        Ok(processed)
    }

    async fn record_execution(
        &self,
        transaction: &mut database::PgTransaction<'_>,
        row: &DecodedTx,
        execution: &Execution,
        state: &SafeState,
    ) -> Result<()> {
        let tx = &execution.transaction;
        multisig_transactions::upsert_execution(
            transaction,
            &MultisigTransaction {
                safe_tx_hash: conv::db_hash(execution.safe_tx_hash),
                safe: conv::db_address(tx.safe),
                ethereum_tx_hash: Some(row.ethereum_tx_hash),
                to_address: Some(conv::db_address(tx.to)),
                value: conv::db_u256(tx.value),
                data: (!tx.data.is_empty()).then(|| tx.data.to_vec()),
                operation: tx.operation as i16,
                safe_tx_gas: conv::db_u256(tx.safe_tx_gas),
                base_gas: conv::db_u256(tx.base_gas),
                gas_price: conv::db_u256(tx.gas_price),
                gas_token: (!tx.gas_token.is_zero()).then(|| conv::db_address(tx.gas_token)),
                refund_receiver: (!tx.refund_receiver.is_zero())
                    .then(|| conv::db_address(tx.refund_receiver)),
                signatures: (!execution.signatures.is_empty())
                    .then(|| execution.signatures.to_vec()),
                nonce: conv::db_block(u64::try_from(tx.nonce).unwrap_or(u64::MAX)),
                failed: Some(execution.failed),
                origin: None,
                trusted: false,
                banned: false,
            },
        )
        .await?;

        // split the executed blob into per-owner confirmations
        match signature::parse_signatures(&execution.safe_tx_hash, &execution.signatures) {
            Ok(signatures) => {
                // successful executions must carry threshold-many owner
                // signatures; anything else points at missed history
                let owner_signers = signatures
                    .iter()
                    .filter(|parsed| state.owners.contains(&parsed.owner))
                    .count();
                if !execution.failed
                    && (owner_signers < signatures.len()
                        || (owner_signers as u64) < state.threshold)
                {
                    tracing::warn!(
                        safe = %state.address,
                        safe_tx_hash = %execution.safe_tx_hash,
                        owner_signers,
                        threshold = state.threshold,
                        "executed signatures disagree with replayed owner set"
                    );
                }
                for parsed in signatures {
                    let (signature, signature_type) = match parsed.kind {
                        SignatureKind::ApprovedHash => (None, SignatureType::ApprovedHash),
                        SignatureKind::Contract => {
                            (Some(parsed.raw.to_vec()), SignatureType::ContractSignature)
                        }
                        SignatureKind::EthSign => {
                            (Some(parsed.raw.to_vec()), SignatureType::EthSign)
                        }
                        SignatureKind::Eoa => (Some(parsed.raw.to_vec()), SignatureType::Eoa),
                    };
                    multisig_confirmations::insert(
                        transaction,
                        &Confirmation {
                            multisig_transaction_hash: conv::db_hash(execution.safe_tx_hash),
                            owner: conv::db_address(parsed.owner),
                            ethereum_tx_hash: Some(row.ethereum_tx_hash),
                            signature,
                            signature_type,
                        },
                    )
                    .await?;
                }
            }
            Err(err) => {
                // the chain accepted it, so keep the execution and move on
                tracing::warn!(
                    safe_tx_hash = %execution.safe_tx_hash,
                    error = %err,
                    "could not split executed signatures"
                );
            }
        }

        self.webhooks.enqueue(WebhookEvent::ExecutedMultisigTransaction {
            safe: tx.safe,
            safe_tx_hash: execution.safe_tx_hash,
            failed: execution.failed,
            block_number: row.block_number as u64,
        });
        Ok(())
    }

    async fn record_module_transaction(
        &self,
        transaction: &mut database::PgTransaction<'_>,
        safe: Address,
        row: &DecodedTx,
        execution: &ModuleExecution,
    ) -> Result<()> {
        module_transactions::insert(
            transaction,
            &ModuleTransaction {
                ethereum_tx_hash: row.ethereum_tx_hash,
                trace_address: row.trace_address.clone(),
                safe: conv::db_address(safe),
                module: conv::db_address(execution.module),
                block_number: row.block_number,
                to_address: Some(conv::db_address(execution.to)),
                value: conv::db_u256(execution.value),
                data: (!execution.data.is_empty()).then(|| execution.data.to_vec()),
                operation: execution.operation as i16,
                success: execution.success,
            },
        )
        .await?;
        self.webhooks.enqueue(WebhookEvent::ModuleTransaction {
            safe,
            module: execution.module,
            block_number: row.block_number as u64,
        });
        Ok(())
    }

    /// Drops the Safe's derived state and rewinds the contract cursors to
    /// its first touched block so the indexers pick everything up again.
    async fn reindex_safe(
        &self,
        transaction: &mut database::PgTransaction<'_>,
        safe: Address,
    ) -> Result<()> {
        let safe_db = conv::db_address(safe);
        let earliest = safe_statuses::earliest_block_for_safe(transaction, &safe_db)
            .await?
            .unwrap_or(0);
        safe_statuses::delete_for_safe(transaction, &safe_db).await?;
        safe_statuses::last::delete(transaction, &safe_db).await?;
        decoded::reset_for_safe(transaction, &safe_db).await?;
        database::safes::rewind_cursors(
            transaction,
            database::safes::CursorTable::MasterCopies,
            earliest,
        )
        .await?;
        Metrics::get().safe_reindexes.inc();
        Ok(())
    }

    /// Spot check: compares the replayed tail state against `eth_call`
    /// reads. A mismatch marks the Safe for reindex.
    pub async fn verify_against_chain(&self, safe: Address) -> Result<bool> {
        let Some(chain) = &self.chain else {
            return Ok(true);
        };
        let safe_db = conv::db_address(safe);
        let mut conn = self.pool.acquire().await?;
        let Some(status) = safe_statuses::last::get(&mut conn, &safe_db).await? else {
            return Ok(true);
        };
        drop(conn);

        let replayed = SafeState::from_db(&status);
        let nonce = chain.safe_nonce(safe).await.context("read nonce")?;
        let threshold = chain.safe_threshold(safe).await.context("read threshold")?;
        let owners: HashSet<_> = chain
            .safe_owners(safe)
            .await
            .context("read owners")?
            .into_iter()
            .collect();
        let replayed_owners: HashSet<_> = replayed.owners.iter().copied().collect();

        // The chain may be ahead of the indexed height, so only a replayed
        // nonce beyond the chain's is proof of corruption.
        let consistent =
            replayed.nonce <= nonce && (replayed.nonce < nonce || (replayed.threshold == threshold && replayed_owners == owners));
        if !consistent {
            tracing::error!(safe = %safe, "replayed state disagrees with chain, reindexing");
            let mut transaction = self.pool.begin().await?;
            self.reindex_safe(&mut transaction, safe).await?;
            transaction.commit().await?;
        }
        Ok(consistent)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloy_primitives::{U256, address}};

    fn ctx() -> ReplayContext {
        ReplayContext {
            chain_id: 1,
            versions: HashMap::new(),
        }
    }

    fn setup_call(owners: &[Address], threshold: u64) -> SafeCall {
        SafeCall::Setup {
            owners: owners.to_vec(),
            threshold,
            fallback_handler: None,
            singleton: Some(address!("d9Db270c1B5E3Bd161E8c8503c55cEABeE709552")),
        }
    }

    fn exec_call(nonce: Option<u64>) -> SafeCall {
        SafeCall::ExecTransaction(Box::new(ExecArgs {
            to: address!("1111111111111111111111111111111111111111"),
            value: U256::ZERO,
            data: Bytes::new(),
            operation: 0,
            safe_tx_gas: U256::ZERO,
            base_gas: U256::ZERO,
            gas_price: U256::ZERO,
            gas_token: Address::ZERO,
            refund_receiver: Address::ZERO,
            signatures: Bytes::new(),
            nonce: nonce.map(U256::from),
            failed: None,
        }))
    }

    #[test]
    fn creation_then_owner_addition() {
        // proxy created with two owners and threshold 1, then an executed
        // transaction adds a third owner and raises the threshold
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let owner_1 = address!("0000000000000000000000000000000000000001");
        let owner_2 = address!("0000000000000000000000000000000000000002");
        let owner_3 = address!("0000000000000000000000000000000000000003");

        let mut state = None;
        let effect = apply(&mut state, safe, &setup_call(&[owner_1, owner_2], 1), false, &ctx())
            .unwrap();
        assert_eq!(effect, Effect::Mutated);
        assert_eq!(state.as_ref().unwrap().nonce, 0);

        let effect = apply(&mut state, safe, &exec_call(None), false, &ctx()).unwrap();
        assert!(matches!(effect, Effect::Executed(_)));

        let effect = apply(
            &mut state,
            safe,
            &SafeCall::AddOwnerWithThreshold {
                owner: owner_3,
                threshold: Some(2),
            },
            false,
            &ctx(),
        )
        .unwrap();
        assert_eq!(effect, Effect::Mutated);

        let state = state.unwrap();
        assert_eq!(state.owners, vec![owner_1, owner_2, owner_3]);
        assert_eq!(state.threshold, 2);
        assert_eq!(state.nonce, 1);
    }

    #[test]
    fn execution_hash_matches_model() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let mut state = None;
        apply(&mut state, safe, &setup_call(&[Address::ZERO], 1), false, &ctx()).unwrap();
        let effect = apply(&mut state, safe, &exec_call(None), false, &ctx()).unwrap();
        let Effect::Executed(execution) = effect else {
            panic!("not executed");
        };
        assert_eq!(
            execution.safe_tx_hash,
            execution.transaction.hash(model::version::V1_3_0, 1)
        );
        assert_eq!(execution.transaction.nonce, U256::ZERO);
    }

    #[test]
    fn event_nonce_mismatch_stops_replay() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let mut state = None;
        apply(&mut state, safe, &setup_call(&[Address::ZERO], 1), false, &ctx()).unwrap();
        let err = apply(&mut state, safe, &exec_call(Some(5)), false, &ctx()).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::NonceMismatch {
                replayed: 0,
                observed: 5
            }
        ));
    }

    #[test]
    fn nested_execution_does_not_advance_nonce() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let mut state = None;
        apply(&mut state, safe, &setup_call(&[Address::ZERO], 1), false, &ctx()).unwrap();
        let effect = apply(&mut state, safe, &exec_call(None), true, &ctx()).unwrap();
        assert!(matches!(effect, Effect::Skipped { .. }));
        assert_eq!(state.unwrap().nonce, 0);
    }

    #[test]
    fn module_execution_leaves_nonce_alone() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let module = address!("0000000000000000000000000000000000000077");
        let mut state = None;
        apply(&mut state, safe, &setup_call(&[Address::ZERO], 1), false, &ctx()).unwrap();
        apply(
            &mut state,
            safe,
            &SafeCall::EnableModule { module },
            false,
            &ctx(),
        )
        .unwrap();

        let effect = apply(
            &mut state,
            safe,
            &SafeCall::ExecTransactionFromModule {
                module: Some(module),
                to: address!("1111111111111111111111111111111111111111"),
                value: U256::from(1u64),
                data: Bytes::new(),
                operation: 0,
                success: Some(true),
            },
            false,
            &ctx(),
        )
        .unwrap();
        let Effect::Module(execution) = effect else {
            panic!("not a module effect");
        };
        assert_eq!(execution.module, module);
        assert!(execution.success);
        let state = state.unwrap();
        assert_eq!(state.nonce, 0);
        assert_eq!(state.enabled_modules, vec![module]);
    }

    #[test]
    fn call_before_setup_is_rejected() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let mut state = None;
        let err = apply(
            &mut state,
            safe,
            &SafeCall::ChangeThreshold { threshold: 2 },
            false,
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, ReplayError::NotInitialized));
    }

    #[test]
    fn repeated_setup_is_skipped() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let owner = address!("0000000000000000000000000000000000000001");
        let mut state = None;
        apply(&mut state, safe, &setup_call(&[owner], 1), false, &ctx()).unwrap();
        let effect = apply(&mut state, safe, &setup_call(&[Address::ZERO], 9), false, &ctx())
            .unwrap();
        assert!(matches!(effect, Effect::Skipped { .. }));
        assert_eq!(state.unwrap().owners, vec![owner]);
    }

    #[test]
    fn removing_untracked_owner_is_inconsistent() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let owner = address!("0000000000000000000000000000000000000001");
        let mut state = None;
        apply(&mut state, safe, &setup_call(&[owner], 1), false, &ctx()).unwrap();
        let err = apply(
            &mut state,
            safe,
            &SafeCall::RemoveOwner {
                prev_owner: None,
                owner: address!("0000000000000000000000000000000000000009"),
                threshold: None,
            },
            false,
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, ReplayError::Inconsistent(_)));
    }

    #[test]
    fn approve_hash_surfaces_confirmation() {
        let safe = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
        let owner = address!("0000000000000000000000000000000000000001");
        let hash = B256::repeat_byte(0x22);
        let mut state = None;
        apply(&mut state, safe, &setup_call(&[owner], 1), false, &ctx()).unwrap();
        let effect = apply(
            &mut state,
            safe,
            &SafeCall::ApproveHash {
                hash,
                owner: Some(owner),
            },
            false,
            &ctx(),
        )
        .unwrap();
        assert_eq!(effect, Effect::Approved { hash, owner });
        // no snapshot, no nonce change
        assert_eq!(state.unwrap().nonce, 0);
    }

    #[test]
    fn trace_prefix_detection() {
        assert!(is_trace_prefix("", "0"));
        assert!(is_trace_prefix("0", "0.1"));
        assert!(is_trace_prefix("0.1", "0.1.5"));
        assert!(!is_trace_prefix("0", "0"));
        assert!(!is_trace_prefix("0", "1.0"));
        assert!(!is_trace_prefix("0.1", "0.10"));
        assert!(!is_trace_prefix("1", ""));
    }
}
