use {
    prometheus::Registry,
    prometheus_metric_storage::StorageRegistry,
    std::sync::OnceLock,
};

static REGISTRY: OnceLock<StorageRegistry> = OnceLock::new();

/// Creates the global metrics registry with a common prefix for every
/// metric. Must run before the first [`get_storage_registry`] call.
pub fn setup_registry(prefix: Option<String>) {
    let registry = Registry::new_custom(prefix, None).expect("invalid metrics prefix");
    let storage = StorageRegistry::new(registry);
    REGISTRY
        .set(storage)
        .expect("metrics registry initialized twice");
}

/// The global metric storage registry. Initializes an unprefixed default if
/// setup was skipped (tests).
pub fn get_storage_registry() -> &'static StorageRegistry {
    REGISTRY.get_or_init(StorageRegistry::default)
}

pub fn get_registry() -> &'static Registry {
    get_storage_registry().registry()
}

/// Renders all metrics in the text exposition format for the metrics
/// endpoint.
pub fn encode() -> String {
    let metrics = get_registry().gather();
    prometheus::TextEncoder::new()
        .encode_to_string(&metrics)
        .unwrap_or_default()
}
