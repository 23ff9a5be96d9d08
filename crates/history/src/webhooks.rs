//! Outbound change notifications. Delivery itself is a collaborator behind
//! [`WebhookSink`]; this module owns payload construction, deduplication
//! keys and the at-least-once retry queue.

use {
    crate::metrics::Metrics,
    alloy_primitives::{Address, B256},
    serde_json::{Value, json},
    std::{sync::Arc, time::Duration},
    tokio::sync::mpsc,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WebhookEvent {
    ExecutedMultisigTransaction {
        safe: Address,
        safe_tx_hash: B256,
        failed: bool,
        block_number: u64,
    },
    PendingMultisigTransaction {
        safe: Address,
        safe_tx_hash: B256,
    },
    NewConfirmation {
        safe: Address,
        safe_tx_hash: B256,
        owner: Address,
        block_number: u64,
    },
    DeletedMultisigTransaction {
        safe: Address,
        safe_tx_hash: B256,
    },
    IncomingToken {
        safe: Address,
        token_address: Address,
        tx_hash: B256,
        log_index: u64,
        block_number: u64,
    },
    OutgoingToken {
        safe: Address,
        token_address: Address,
        tx_hash: B256,
        log_index: u64,
        block_number: u64,
    },
    IncomingEther {
        safe: Address,
        tx_hash: B256,
        value: String,
        block_number: u64,
    },
    OutgoingEther {
        safe: Address,
        tx_hash: B256,
        value: String,
        block_number: u64,
    },
    ModuleTransaction {
        safe: Address,
        module: Address,
        block_number: u64,
    },
    ReorgDetected {
        block_number: u64,
    },
}

impl WebhookEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutedMultisigTransaction { .. } => "EXECUTED_MULTISIG_TRANSACTION",
            Self::PendingMultisigTransaction { .. } => "PENDING_MULTISIG_TRANSACTION",
            Self::NewConfirmation { .. } => "NEW_CONFIRMATION",
            Self::DeletedMultisigTransaction { .. } => "DELETED_MULTISIG_TRANSACTION",
            Self::IncomingToken { .. } => "INCOMING_TOKEN",
            Self::OutgoingToken { .. } => "OUTGOING_TOKEN",
            Self::IncomingEther { .. } => "INCOMING_ETHER",
            Self::OutgoingEther { .. } => "OUTGOING_ETHER",
            Self::ModuleTransaction { .. } => "MODULE_TRANSACTION",
            Self::ReorgDetected { .. } => "REORG_DETECTED",
        }
    }

    /// Sinks deliver at least once; consumers dedup on this key.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::ExecutedMultisigTransaction { safe_tx_hash, .. }
            | Self::PendingMultisigTransaction { safe_tx_hash, .. }
            | Self::DeletedMultisigTransaction { safe_tx_hash, .. } => {
                format!("{}:{safe_tx_hash}", self.event_type())
            }
            Self::NewConfirmation {
                safe_tx_hash, owner, ..
            } => format!("{}:{safe_tx_hash}:{owner}", self.event_type()),
            Self::IncomingToken {
                tx_hash, log_index, ..
            }
            | Self::OutgoingToken {
                tx_hash, log_index, ..
            } => format!("{}:{tx_hash}:{log_index}", self.event_type()),
            Self::IncomingEther { safe, tx_hash, .. }
            | Self::OutgoingEther { safe, tx_hash, .. } => {
                format!("{}:{tx_hash}:{safe}", self.event_type())
            }
            Self::ModuleTransaction {
                safe, block_number, ..
            } => format!("{}:{safe}:{block_number}", self.event_type()),
            Self::ReorgDetected { block_number } => {
                format!("{}:{block_number}", self.event_type())
            }
        }
    }

    pub fn payload(&self) -> Value {
        let mut payload = match self {
            Self::ExecutedMultisigTransaction {
                safe,
                safe_tx_hash,
                failed,
                block_number,
            } => json!({
                "address": safe.to_string(),
                "safeTxHash": safe_tx_hash.to_string(),
                "failed": failed,
                "blockNumber": block_number,
            }),
            Self::PendingMultisigTransaction { safe, safe_tx_hash }
            | Self::DeletedMultisigTransaction { safe, safe_tx_hash } => json!({
                "address": safe.to_string(),
                "safeTxHash": safe_tx_hash.to_string(),
            }),
            Self::NewConfirmation {
                safe,
                safe_tx_hash,
                owner,
                block_number,
            } => json!({
                "address": safe.to_string(),
                "safeTxHash": safe_tx_hash.to_string(),
                "owner": owner.to_string(),
                "blockNumber": block_number,
            }),
            Self::IncomingToken {
                safe,
                token_address,
                tx_hash,
                log_index,
                block_number,
            }
            | Self::OutgoingToken {
                safe,
                token_address,
                tx_hash,
                log_index,
                block_number,
            } => json!({
                "address": safe.to_string(),
                "tokenAddress": token_address.to_string(),
                "txHash": tx_hash.to_string(),
                "logIndex": log_index,
                "blockNumber": block_number,
            }),
            Self::IncomingEther {
                safe,
                tx_hash,
                value,
                block_number,
            }
            | Self::OutgoingEther {
                safe,
                tx_hash,
                value,
                block_number,
            } => json!({
                "address": safe.to_string(),
                "txHash": tx_hash.to_string(),
                "value": value,
                "blockNumber": block_number,
            }),
            Self::ModuleTransaction {
                safe,
                module,
                block_number,
            } => json!({
                "address": safe.to_string(),
                "module": module.to_string(),
                "blockNumber": block_number,
            }),
            Self::ReorgDetected { block_number } => json!({
                "blockNumber": block_number,
            }),
        };
        payload["type"] = Value::String(self.event_type().to_string());
        payload
    }
}

/// External delivery of one payload. Implementations post to their
/// endpoint; returning an error requeues the event.
#[async_trait::async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, payload: &Value) -> anyhow::Result<()>;
}

/// Swallows every event. Used when no sink is configured.
pub struct NoopSink;

#[async_trait::async_trait]
impl WebhookSink for NoopSink {
    async fn deliver(&self, _payload: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

const MAX_DELIVERY_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const QUEUE_SIZE: usize = 10_000;

/// Queue handle shared by everything that emits events. Enqueueing never
/// blocks indexing; a full queue drops the event with a log line since the
/// sink contract is at-least-once, not guaranteed.
#[derive(Clone)]
pub struct Webhooks {
    sender: mpsc::Sender<WebhookEvent>,
}

impl Webhooks {
    pub fn new(sink: Arc<dyn WebhookSink>) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_SIZE);
        tokio::task::spawn(deliver_loop(sink, receiver));
        Self { sender }
    }

    pub fn enqueue(&self, event: WebhookEvent) {
        if let Err(err) = self.sender.try_send(event) {
            tracing::warn!(error = %err, "webhook queue full, dropping event");
        }
    }
}

async fn deliver_loop(sink: Arc<dyn WebhookSink>, mut receiver: mpsc::Receiver<WebhookEvent>) {
    while let Some(event) = receiver.recv().await {
        let payload = event.payload();
        let mut attempt = 0;
        loop {
            match sink.deliver(&payload).await {
                Ok(()) => {
                    Metrics::get()
                        .webhook_deliveries
                        .with_label_values(&["delivered"])
                        .inc();
                    break;
                }
                Err(err) if attempt + 1 < MAX_DELIVERY_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(
                        dedup_key = %event.dedup_key(),
                        attempt,
                        error = %err,
                        "webhook delivery failed, retrying"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    Metrics::get()
                        .webhook_deliveries
                        .with_label_values(&["dropped"])
                        .inc();
                    tracing::error!(
                        dedup_key = %event.dedup_key(),
                        error = %err,
                        "webhook delivery exhausted retries"
                    );
                    break;
                }
            }
        }
    }
}
