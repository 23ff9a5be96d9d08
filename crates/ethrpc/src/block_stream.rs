use {
    crate::Rpc,
    alloy_primitives::B256,
    anyhow::{Context, Result},
    std::time::Duration,
    tokio::sync::watch,
    tokio_stream::{Stream, StreamExt, wrappers::WatchStream},
};

/// The chain head as seen at the last poll.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// Receiver always holding the most recently observed head. Obtained from
/// [`current_block_stream`]; clone freely.
pub type CurrentBlockWatcher = watch::Receiver<BlockInfo>;

/// Spawns a background task polling the node for the latest block on a fixed
/// interval, publishing every new head into the returned watcher. Errors
/// while polling are logged and the previous head is kept; the task only
/// ends when every receiver is dropped.
pub async fn current_block_stream(
    rpc: Rpc,
    poll_interval: Duration,
) -> Result<CurrentBlockWatcher> {
    let initial = rpc
        .latest_block()
        .await?
        .context("node has no latest block")?;
    let (sender, receiver) = watch::channel(BlockInfo {
        number: initial.number,
        hash: initial.hash,
        parent_hash: initial.parent_hash,
        timestamp: initial.timestamp,
    });

    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let header = match rpc.latest_block().await {
                Ok(Some(header)) => header,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to poll latest block");
                    continue;
                }
            };
            let block = BlockInfo {
                number: header.number,
                hash: header.hash,
                parent_hash: header.parent_hash,
                timestamp: header.timestamp,
            };
            let current = *sender.borrow();
            if current == block {
                continue;
            }
            if block.number < current.number {
                tracing::debug!(
                    current = current.number,
                    observed = block.number,
                    "node lagging behind previously observed head"
                );
            }
            tracing::debug!(number = block.number, hash = %block.hash, "new block");
            if sender.send(block).is_err() {
                // all receivers gone
                break;
            }
        }
    });

    Ok(receiver)
}

/// Adapts the watcher into a stream yielding the current head immediately
/// and then every subsequent head.
pub fn into_stream(watcher: CurrentBlockWatcher) -> impl Stream<Item = BlockInfo> + Unpin {
    WatchStream::new(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_yields_current_value_first() {
        let block = BlockInfo {
            number: 7,
            ..Default::default()
        };
        let (sender, receiver) = watch::channel(block);
        let mut stream = into_stream(receiver);
        assert_eq!(stream.next().await.unwrap().number, 7);

        sender
            .send(BlockInfo {
                number: 8,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stream.next().await.unwrap().number, 8);
    }
}
