//! Conversions between chain types and their database representations.

use {
    alloy_primitives::{Address, B256, U256},
    bigdecimal::BigDecimal,
};

pub fn db_address(address: Address) -> database::Address {
    database::byte_array::ByteArray(address.into_array())
}

pub fn address_from_db(address: database::Address) -> Address {
    Address::from(address.0)
}

pub fn db_hash(hash: B256) -> database::TransactionHash {
    database::byte_array::ByteArray(hash.0)
}

pub fn hash_from_db(hash: database::TransactionHash) -> B256 {
    B256::from(hash.0)
}

pub fn db_u256(value: U256) -> BigDecimal {
    database::u256_to_big_decimal(&value.to_be_bytes::<32>())
}

pub fn u256_from_db(value: &BigDecimal) -> Option<U256> {
    database::big_decimal_to_u256(value).map(U256::from_be_bytes)
}

/// Block numbers come from the node as u64 but postgres has no unsigned
/// integers. Heights beyond i64 do not happen on real chains; saturate
/// instead of wrapping if they ever do.
pub fn db_block(number: u64) -> i64 {
    i64::try_from(number).unwrap_or(i64::MAX)
}
