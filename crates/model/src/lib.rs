//! Chain independent domain model: the Safe transaction with its EIP-712
//! identity, owner signatures, and contract version handling.

pub mod safe_tx;
pub mod signature;
pub mod version;

pub use {
    safe_tx::{Operation, SafeTransaction},
    signature::{SafeSignature, SignatureError, SignatureKind},
    version::SafeVersion,
};
