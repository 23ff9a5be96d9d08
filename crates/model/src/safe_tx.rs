use {
    crate::version::SafeVersion,
    alloy_primitives::{Address, B256, Bytes, U256, keccak256},
    alloy_sol_types::{SolStruct, SolValue, eip712_domain, sol},
    serde::{Deserialize, Serialize},
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    #[default]
    Call = 0,
    DelegateCall = 1,
}

impl TryFrom<u8> for Operation {
    type Error = InvalidOperation;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Call),
            1 => Ok(Self::DelegateCall),
            other => Err(InvalidOperation(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid operation byte {0}")]
pub struct InvalidOperation(u8);

sol! {
    struct SafeTx {
        address to;
        uint256 value;
        bytes data;
        uint8 operation;
        uint256 safeTxGas;
        uint256 baseGas;
        uint256 gasPrice;
        address gasToken;
        address refundReceiver;
        uint256 nonce;
    }
}

mod legacy {
    alloy_sol_types::sol! {
        struct SafeTx {
            address to;
            uint256 value;
            bytes data;
            uint8 operation;
            uint256 safeTxGas;
            uint256 dataGas;
            uint256 gasPrice;
            address gasToken;
            address refundReceiver;
            uint256 nonce;
        }
    }
}

/// A Safe transaction as proposed or executed. Its EIP-712 hash over the
/// Safe's domain is the identity that binds off-chain proposals to on-chain
/// executions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SafeTransaction {
    pub safe: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: Operation,
    pub safe_tx_gas: U256,
    pub base_gas: U256,
    pub gas_price: U256,
    pub gas_token: Address,
    pub refund_receiver: Address,
    pub nonce: U256,
}

impl SafeTransaction {
    /// The EIP-712 struct hash. Versions before 1.0.0 named the base gas
    /// field `dataGas`, which gives those Safes a different type hash over
    /// identical values.
    fn struct_hash(&self, version: SafeVersion) -> B256 {
        if version.uses_base_gas() {
            SafeTx {
                to: self.to,
                value: self.value,
                data: self.data.clone(),
                operation: self.operation as u8,
                safeTxGas: self.safe_tx_gas,
                baseGas: self.base_gas,
                gasPrice: self.gas_price,
                gasToken: self.gas_token,
                refundReceiver: self.refund_receiver,
                nonce: self.nonce,
            }
            .eip712_hash_struct()
        } else {
            legacy::SafeTx {
                to: self.to,
                value: self.value,
                data: self.data.clone(),
                operation: self.operation as u8,
                safeTxGas: self.safe_tx_gas,
                dataGas: self.base_gas,
                gasPrice: self.gas_price,
                gasToken: self.gas_token,
                refundReceiver: self.refund_receiver,
                nonce: self.nonce,
            }
            .eip712_hash_struct()
        }
    }

    /// The Safe's EIP-712 domain separator. Before 1.3.0 the domain is just
    /// the verifying contract; 1.3.0 added the chain id.
    pub fn domain_separator(safe: Address, version: SafeVersion, chain_id: u64) -> B256 {
        if version.domain_includes_chain_id() {
            let domain = eip712_domain! {
                chain_id: chain_id,
                verifying_contract: safe,
            };
            domain.hash_struct()
        } else {
            let domain = eip712_domain! {
                verifying_contract: safe,
            };
            domain.hash_struct()
        }
    }

    /// `keccak256(0x19 || 0x01 || domainSeparator || structHash)`, the
    /// `safeTxHash` that identifies this transaction.
    pub fn hash(&self, version: SafeVersion, chain_id: u64) -> B256 {
        let domain_separator = Self::domain_separator(self.safe, version, chain_id);
        let struct_hash = self.struct_hash(version);
        let mut buffer = Vec::with_capacity(2 + 32 + 32);
        buffer.extend_from_slice(&[0x19, 0x01]);
        buffer.extend_from_slice(domain_separator.as_slice());
        buffer.extend_from_slice(struct_hash.as_slice());
        keccak256(&buffer)
    }
}

/// The message hash `eth_sign` based confirmations actually sign:
/// the safeTxHash wrapped in the Ethereum signed message envelope.
pub fn eth_sign_hash(safe_tx_hash: &B256) -> B256 {
    let mut buffer = Vec::with_capacity(28 + 32);
    buffer.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    buffer.extend_from_slice(safe_tx_hash.as_slice());
    keccak256(&buffer)
}

#[cfg(test)]
mod tests {
    use {super::*, alloy_primitives::address, hex_literal::hex};

    // Type hash constants from the deployed Safe contracts.
    const SAFE_TX_TYPEHASH: [u8; 32] =
        hex!("bb8310d486368db6bd6f849402fdd73ad53d316b5a4b2644ad6efe0f941286d8");
    const SAFE_TX_TYPEHASH_LEGACY: [u8; 32] =
        hex!("14d461bc7412367e924637b363c7bf29b8f47e2f84869f4426e5633d8af47b20");
    const DOMAIN_TYPEHASH: [u8; 32] =
        hex!("47e79534a245952e8b16893a336b85a3d9ea9fa8c573f3d803afb92a79469218");
    const DOMAIN_TYPEHASH_LEGACY: [u8; 32] =
        hex!("035aff83d86937d35b32e04f0ddc6ff469290eef2f1b692d8a815c89404d4749");

    fn sample() -> SafeTransaction {
        SafeTransaction {
            safe: address!("5afe5afe5afe5afe5afe5afe5afe5afe5afe5afe"),
            to: address!("1111111111111111111111111111111111111111"),
            value: U256::from(1_000_000_000u64),
            data: Bytes::from_static(&[0xab, 0xcd]),
            operation: Operation::Call,
            safe_tx_gas: U256::from(100_000u64),
            base_gas: U256::from(21_000u64),
            gas_price: U256::from(1u64),
            gas_token: Address::ZERO,
            refund_receiver: Address::ZERO,
            nonce: U256::from(7u64),
        }
    }

    #[test]
    fn type_hashes_match_deployed_contracts() {
        assert_eq!(
            keccak256(SafeTx::eip712_encode_type().as_bytes()).0,
            SAFE_TX_TYPEHASH
        );
        assert_eq!(
            keccak256(legacy::SafeTx::eip712_encode_type().as_bytes()).0,
            SAFE_TX_TYPEHASH_LEGACY
        );
    }

    #[test]
    fn domain_separator_manual_cross_check() {
        let safe = sample().safe;
        let chain_id = 5u64;

        let with_chain = (B256::from(DOMAIN_TYPEHASH), U256::from(chain_id), safe);
        let expected = keccak256(with_chain.abi_encode());
        assert_eq!(
            SafeTransaction::domain_separator(safe, "1.3.0".parse().unwrap(), chain_id),
            expected
        );

        let without_chain = (B256::from(DOMAIN_TYPEHASH_LEGACY), safe);
        let expected = keccak256(without_chain.abi_encode());
        assert_eq!(
            SafeTransaction::domain_separator(safe, "1.1.1".parse().unwrap(), chain_id),
            expected
        );
    }

    #[test]
    fn hash_manual_cross_check() {
        let tx = sample();
        let version: SafeVersion = "1.3.0".parse().unwrap();
        let chain_id = 1u64;

        // independent construction of the struct hash
        let encoded = (
            B256::from(SAFE_TX_TYPEHASH),
            tx.to,
            tx.value,
            keccak256(&tx.data),
            U256::from(tx.operation as u8),
            tx.safe_tx_gas,
            tx.base_gas,
            tx.gas_price,
            tx.gas_token,
            tx.refund_receiver,
            tx.nonce,
        )
            .abi_encode();
        let struct_hash = keccak256(encoded);
        let domain = SafeTransaction::domain_separator(tx.safe, version, chain_id);
        let mut packed = vec![0x19, 0x01];
        packed.extend_from_slice(domain.as_slice());
        packed.extend_from_slice(struct_hash.as_slice());
        let expected = keccak256(&packed);

        assert_eq!(tx.hash(version, chain_id), expected);
    }

    #[test]
    fn hash_depends_on_version_and_chain() {
        let tx = sample();
        let v130: SafeVersion = "1.3.0".parse().unwrap();
        let v111: SafeVersion = "1.1.1".parse().unwrap();
        let v092: SafeVersion = "0.9.2".parse().unwrap();

        let mainnet = tx.hash(v130, 1);
        assert_ne!(mainnet, tx.hash(v130, 100));
        assert_ne!(mainnet, tx.hash(v111, 1));
        // pre-1.0 changes the type hash on top of the domain
        assert_ne!(tx.hash(v111, 1), tx.hash(v092, 1));
        // 1.1.1 and 0.9.2 share the chain-free domain; hashes differ only
        // through the type hash, deterministically
        assert_eq!(tx.hash(v111, 1), tx.hash(v111, 100));
    }

    #[test]
    fn eth_sign_envelope() {
        let hash = B256::repeat_byte(0x11);
        let mut packed = b"\x19Ethereum Signed Message:\n32".to_vec();
        packed.extend_from_slice(hash.as_slice());
        assert_eq!(eth_sign_hash(&hash), keccak256(&packed));
    }
}
