use alloy_primitives::{Address, Bytes, U256};

/// One operation inside a MultiSend batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultiSendTx {
    /// 0 CALL, 1 DELEGATECALL
    pub operation: u8,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum MultiSendError {
    #[error("truncated multisend payload at offset {0}")]
    Truncated(usize),
    #[error("invalid operation byte {0}")]
    InvalidOperation(u8),
}

/// Packs operations into the MultiSend wire format:
/// `operation (1) || to (20) || value (32) || data.len() (32) || data`,
/// repeated per transaction with no separators.
pub fn encode(txs: &[MultiSendTx]) -> Bytes {
    let mut packed = Vec::new();
    for tx in txs {
        packed.push(tx.operation);
        packed.extend_from_slice(tx.to.as_slice());
        packed.extend_from_slice(&tx.value.to_be_bytes::<32>());
        packed.extend_from_slice(&U256::from(tx.data.len()).to_be_bytes::<32>());
        packed.extend_from_slice(&tx.data);
    }
    packed.into()
}

/// The inverse of [`encode`].
pub fn decode(packed: &[u8]) -> Result<Vec<MultiSendTx>, MultiSendError> {
    let mut txs = Vec::new();
    let mut offset = 0;
    while offset < packed.len() {
        let header_end = offset + 1 + 20 + 32 + 32;
        if packed.len() < header_end {
            return Err(MultiSendError::Truncated(offset));
        }
        let operation = packed[offset];
        if operation > 1 {
            return Err(MultiSendError::InvalidOperation(operation));
        }
        let to = Address::from_slice(&packed[offset + 1..offset + 21]);
        let value = U256::from_be_slice(&packed[offset + 21..offset + 53]);
        let data_len = U256::from_be_slice(&packed[offset + 53..offset + 85]);
        let data_len = usize::try_from(data_len).map_err(|_| MultiSendError::Truncated(offset))?;
        let data_end = header_end
            .checked_add(data_len)
            .ok_or(MultiSendError::Truncated(offset))?;
        if packed.len() < data_end {
            return Err(MultiSendError::Truncated(offset));
        }
        txs.push(MultiSendTx {
            operation,
            to,
            value,
            data: Bytes::copy_from_slice(&packed[header_end..data_end]),
        });
        offset = data_end;
    }
    Ok(txs)
}

#[cfg(test)]
mod tests {
    use {super::*, alloy_primitives::address};

    #[test]
    fn roundtrip() {
        let txs = vec![
            MultiSendTx {
                operation: 0,
                to: address!("a9059cbb2ab09eb219583f4a59a5d0623ade346d"),
                value: U256::from(1u64),
                data: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
            },
            MultiSendTx {
                operation: 1,
                to: Address::ZERO,
                value: U256::ZERO,
                data: Bytes::new(),
            },
        ];
        let packed = encode(&txs);
        assert_eq!(decode(&packed).unwrap(), txs);
    }

    #[test]
    fn empty_batch() {
        assert_eq!(decode(&[]).unwrap(), vec![]);
        assert_eq!(encode(&[]), Bytes::new());
    }

    #[test]
    fn rejects_truncated_payload() {
        let txs = vec![MultiSendTx {
            operation: 0,
            to: Address::ZERO,
            value: U256::ZERO,
            data: Bytes::from_static(&[1, 2, 3]),
        }];
        let packed = encode(&txs);
        assert!(matches!(
            decode(&packed[..packed.len() - 1]),
            Err(MultiSendError::Truncated(_))
        ));
    }

    #[test]
    fn rejects_bad_operation() {
        let txs = vec![MultiSendTx {
            operation: 0,
            to: Address::ZERO,
            value: U256::ZERO,
            data: Bytes::new(),
        }];
        let mut packed = encode(&txs).to_vec();
        packed[0] = 2;
        assert!(matches!(
            decode(&packed),
            Err(MultiSendError::InvalidOperation(2))
        ));
    }
}
