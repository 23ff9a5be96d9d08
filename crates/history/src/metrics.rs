#[derive(prometheus_metric_storage::MetricStorage, Clone, Debug)]
#[metric(subsystem = "history")]
pub struct Metrics {
    /// Last block each indexer finished, labelled by indexer name.
    #[metric(labels("indexer"))]
    pub last_indexed_block: prometheus::IntGaugeVec,

    /// Blocks indexed per tick, labelled by indexer name.
    #[metric(labels("indexer"))]
    pub indexed_blocks: prometheus::IntCounterVec,

    /// Provider rejections that made an indexer shrink its block range.
    #[metric(labels("indexer"))]
    pub range_shrinks: prometheus::IntCounterVec,

    /// Decoded Safe calls applied by the replay processor.
    pub decoded_calls_processed: prometheus::IntCounter,

    /// Replays stopped by malformed or inconsistent calls.
    pub replay_errors: prometheus::IntCounter,

    /// Safes whose snapshot series showed nonce gaps.
    pub corrupted_safes: prometheus::IntCounter,

    /// Full per-Safe reindex operations scheduled.
    pub safe_reindexes: prometheus::IntCounter,

    /// Chain reorganizations detected and rewound.
    pub reorgs: prometheus::IntCounter,

    /// Webhook deliveries, labelled by final outcome.
    #[metric(labels("outcome"))]
    pub webhook_deliveries: prometheus::IntCounterVec,
}

impl Metrics {
    pub fn get() -> &'static Self {
        Self::instance(observe::metrics::get_storage_registry())
            .expect("unexpected error getting metrics instance")
    }
}
