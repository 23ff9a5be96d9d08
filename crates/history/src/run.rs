use {
    crate::{
        arguments::{Arguments, IndexerMode},
        conv,
        indexers::{
            IndexerRunner, erc20_721::Erc20721Indexer, internal_txs::InternalTxIndexer,
            proxy_factory::ProxyFactoryIndexer, safe_events::SafeEventsIndexer,
        },
        processor::{ChainReader, ReplayContext, TxProcessor},
        reorgs::ReorgController,
        scheduler::{TaskConfig, spawn_periodic},
        webhooks::{NoopSink, Webhooks},
    },
    alloy_primitives::Address,
    alloy_sol_types::SolCall,
    anyhow::{Context, Result},
    clap::Parser,
    contracts::ISafe,
    ethrpc::{Rpc, current_block_stream},
    sqlx::PgPool,
    std::{collections::HashMap, sync::Arc},
};

pub async fn run(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    observe::tracing::initialize(&args.log_filter);
    observe::panic_hook::install();
    observe::metrics::setup_registry(Some("safe_history".into()));
    tracing::info!("running history indexer with validated arguments:\n{args}");

    if let Err(err) = run_until_shutdown(args).await {
        tracing::error!(error = ?err, "service failed");
        std::process::exit(1);
    }
}

async fn run_until_shutdown(args: Arguments) -> Result<()> {
    let pool = PgPool::connect(args.db_url.as_str())
        .await
        .context("connect database")?;
    let rpc = Rpc::new(&args.node_url, args.rpc_timeout);
    let tracing_rpc = args
        .tracing_node_url
        .as_ref()
        .map(|url| Rpc::new(url, args.rpc_timeout))
        .unwrap_or_else(|| rpc.clone());

    seed_contracts(&pool, &args).await?;
    let mode = select_mode(&args);
    tracing::info!(?mode, "indexer mode selected");

    let ctx = ReplayContext {
        chain_id: args.chain_id,
        versions: args
            .master_copy_addresses
            .iter()
            .map(|master_copy| (master_copy.address, master_copy.version))
            .collect::<HashMap<_, _>>(),
    };

    let webhooks = Webhooks::new(Arc::new(NoopSink));
    let current_block = current_block_stream(rpc.clone(), args.block_poll_interval)
        .await
        .context("start block stream")?;

    let mut runners = vec![IndexerRunner::new(
        Arc::new(ProxyFactoryIndexer::new(pool.clone(), rpc.clone())),
        current_block.clone(),
        args.block_process_limit,
        args.block_process_limit_max,
    )];
    match mode {
        SelectedMode::Events => runners.push(IndexerRunner::new(
            Arc::new(SafeEventsIndexer::new(pool.clone(), rpc.clone())),
            current_block.clone(),
            args.block_process_limit,
            args.block_process_limit_max,
        )),
        SelectedMode::Traces => runners.push(IndexerRunner::new(
            Arc::new(InternalTxIndexer::new(
                pool.clone(),
                tracing_rpc.clone(),
                webhooks.clone(),
            )),
            current_block.clone(),
            args.block_process_limit,
            args.block_process_limit_max,
        )),
    }
    runners.push(IndexerRunner::new(
        Arc::new(Erc20721Indexer::new(
            pool.clone(),
            rpc.clone(),
            args.erc20_721_start_block,
            webhooks.clone(),
        )),
        current_block.clone(),
        args.block_process_limit,
        args.block_process_limit_max,
    ));

    let mut tasks = Vec::new();
    for runner in runners {
        let runner = Arc::new(runner);
        let config = TaskConfig {
            name: runner.name(),
            period: args.indexer_poll_interval,
            soft_timeout: args.task_soft_timeout,
            hard_timeout: args.task_hard_timeout,
        };
        let task_runner = runner.clone();
        tasks.push(spawn_periodic(pool.clone(), config, move || {
            let runner = task_runner.clone();
            async move { runner.run_once().await.map(|_| ()) }
        }));
    }

    let processor = Arc::new(TxProcessor::new(
        pool.clone(),
        ctx.clone(),
        webhooks.clone(),
        Some(Arc::new(SafeChainReader { rpc: rpc.clone() }) as Arc<dyn ChainReader>),
    ));
    tasks.push(spawn_periodic(
        pool.clone(),
        TaskConfig {
            name: "tx_processor",
            period: args.processor_poll_interval,
            soft_timeout: args.task_soft_timeout,
            hard_timeout: args.task_hard_timeout,
        },
        move || {
            let processor = processor.clone();
            async move { processor.process_pending().await.map(|_| ()) }
        },
    ));

    let reorgs = Arc::new(ReorgController::new(
        pool.clone(),
        rpc.clone(),
        webhooks.clone(),
        args.reorg_depth,
        args.reorg_rewind_blocks,
    ));
    tasks.push(spawn_periodic(
        pool.clone(),
        TaskConfig {
            name: "reorg_controller",
            period: args.reorg_poll_interval,
            soft_timeout: args.task_soft_timeout,
            hard_timeout: args.task_hard_timeout,
        },
        move || {
            let reorgs = reorgs.clone();
            async move { reorgs.run_once().await.map(|_| ()) }
        },
    ));

    tokio::signal::ctrl_c().await.context("listen for shutdown")?;
    tracing::info!("shutdown signal received");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SelectedMode {
    Events,
    Traces,
}

/// `auto` resolves to events when any configured master copy emits the L2
/// event set or when no tracing endpoint is available.
fn select_mode(args: &Arguments) -> SelectedMode {
    match args.indexer_mode {
        IndexerMode::Events => SelectedMode::Events,
        IndexerMode::Traces => SelectedMode::Traces,
        IndexerMode::Auto => {
            let any_l2 = args.master_copy_addresses.iter().any(|mc| mc.l2);
            if any_l2 || args.tracing_node_url.is_none() {
                SelectedMode::Events
            } else {
                SelectedMode::Traces
            }
        }
    }
}

/// Registers the configured factories and master copies. Existing cursor
/// positions are preserved; only the metadata is refreshed.
async fn seed_contracts(pool: &PgPool, args: &Arguments) -> Result<()> {
    let mut conn = pool.acquire().await?;
    for factory in &args.factory_addresses {
        database::safes::upsert_proxy_factory(
            &mut conn,
            &database::safes::ProxyFactory {
                address: conv::db_address(factory.address),
                initial_block_number: conv::db_block(factory.deployed_block),
                tx_block_number: None,
            },
        )
        .await?;
    }
    for master_copy in &args.master_copy_addresses {
        database::safes::upsert_master_copy(
            &mut conn,
            &database::safes::SafeMasterCopy {
                address: conv::db_address(master_copy.address),
                initial_block_number: conv::db_block(master_copy.deployed_block),
                tx_block_number: None,
                version: master_copy.version.to_string(),
                l2: master_copy.l2,
            },
        )
        .await?;
    }
    Ok(())
}

/// `eth_call` backed spot checks used by the replay corruption detector.
struct SafeChainReader {
    rpc: Rpc,
}

#[async_trait::async_trait]
impl ChainReader for SafeChainReader {
    async fn safe_nonce(&self, safe: Address) -> Result<u64> {
        let output = self
            .rpc
            .call(safe, ISafe::nonceCall {}.abi_encode().into())
            .await?;
        let nonce = ISafe::nonceCall::abi_decode_returns(&output)?;
        Ok(u64::try_from(nonce).unwrap_or(u64::MAX))
    }

    async fn safe_threshold(&self, safe: Address) -> Result<u64> {
        let output = self
            .rpc
            .call(safe, ISafe::getThresholdCall {}.abi_encode().into())
            .await?;
        let threshold = ISafe::getThresholdCall::abi_decode_returns(&output)?;
        Ok(u64::try_from(threshold).unwrap_or(u64::MAX))
    }

    async fn safe_owners(&self, safe: Address) -> Result<Vec<Address>> {
        let output = self
            .rpc
            .call(safe, ISafe::getOwnersCall {}.abi_encode().into())
            .await?;
        Ok(ISafe::getOwnersCall::abi_decode_returns(&output)?)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::arguments::MasterCopySpec};

    fn base_args(extra: &[&str]) -> Arguments {
        let mut argv = vec!["history"];
        argv.extend_from_slice(extra);
        Arguments::parse_from(argv)
    }

    #[test]
    fn auto_mode_resolution() {
        // no tracing url, no l2: events by necessity
        assert_eq!(select_mode(&base_args(&[])), SelectedMode::Events);

        // tracing url present: traces
        let args = base_args(&["--tracing-node-url", "http://localhost:8545"]);
        assert_eq!(select_mode(&args), SelectedMode::Traces);

        // l2 master copy wins over the tracing url
        let mut args = base_args(&["--tracing-node-url", "http://localhost:8545"]);
        args.master_copy_addresses = vec![
            "0x3E5c63644E683549055b9Be8653de26E0B4CD36E:12504268:1.3.0:l2"
                .parse::<MasterCopySpec>()
                .unwrap(),
        ];
        assert_eq!(select_mode(&args), SelectedMode::Events);

        // explicit flags are never second-guessed
        let args = base_args(&["--indexer-mode", "traces"]);
        assert_eq!(select_mode(&args), SelectedMode::Traces);
    }
}
