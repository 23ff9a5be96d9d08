use {
    crate::safe_tx::eth_sign_hash,
    alloy_primitives::{Address, B256, Signature, U256},
};

/// How an owner attested to a safeTxHash. The variant is encoded in the `v`
/// byte of each 65 byte signature chunk, the scheme the Safe contracts use
/// in `checkSignatures`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureKind {
    /// `v = 0`: an EIP-1271 contract signature; `r` carries the signing
    /// contract. The dynamic payload is appended after the static part.
    Contract,
    /// `v = 1`: the owner in `r` called `approveHash` on chain.
    ApprovedHash,
    /// `v > 30`: an ECDSA signature over the `eth_sign` envelope of the
    /// hash, with 4 added to `v`.
    EthSign,
    /// `v ∈ {27, 28}`: a plain ECDSA signature over the hash itself.
    Eoa,
}

/// One parsed owner signature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SafeSignature {
    pub kind: SignatureKind,
    pub owner: Address,
    /// The 65 byte static chunk as it appeared in the blob. For contract
    /// signatures the dynamic payload is not included.
    pub raw: [u8; 65],
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signature blob of {0} bytes is shorter than one signature")]
    InvalidLength(usize),
    #[error("signature {index} has invalid v byte {v}")]
    InvalidV { index: usize, v: u8 },
    #[error("signature {index} does not recover: {source}")]
    Recovery {
        index: usize,
        #[source]
        source: alloy_primitives::SignatureError,
    },
}

fn address_from_word(word: &[u8]) -> Address {
    Address::from_slice(&word[12..32])
}

/// Splits a concatenated signature blob into per-owner signatures and
/// recovers each owner. `safe_tx_hash` is the hash the signatures commit to.
///
/// Contract signatures reference their dynamic payload via an offset in
/// `s`; only the static 65 byte chunks participate in the split, which is
/// how the Safe itself iterates the blob.
pub fn parse_signatures(
    safe_tx_hash: &B256,
    blob: &[u8],
) -> Result<Vec<SafeSignature>, SignatureError> {
    // The blob is 65 bytes per signer plus the dynamic payloads of any
    // contract signatures, so overall length is not a chunk multiple.
    if blob.len() < 65 {
        return Err(SignatureError::InvalidLength(blob.len()));
    }
    // Dynamic contract signature payloads live past the static part; stop
    // splitting at the first offset one points into.
    let mut static_end = blob.len();
    let mut signatures = Vec::new();
    let mut index = 0;
    while (index + 1) * 65 <= static_end {
        let chunk: [u8; 65] = blob[index * 65..(index + 1) * 65].try_into().unwrap();
        let r = &chunk[0..32];
        let s = &chunk[32..64];
        let v = chunk[64];
        let signature = match v {
            0 => {
                let offset = U256::from_be_slice(s);
                if let Ok(offset) = usize::try_from(offset)
                    && offset < static_end
                    && offset >= (index + 1) * 65
                {
                    static_end = offset;
                }
                SafeSignature {
                    kind: SignatureKind::Contract,
                    owner: address_from_word(r),
                    raw: chunk,
                }
            }
            1 => SafeSignature {
                kind: SignatureKind::ApprovedHash,
                owner: address_from_word(r),
                raw: chunk,
            },
            27 | 28 => {
                let owner = recover(r, s, v - 27, safe_tx_hash)
                    .map_err(|source| SignatureError::Recovery { index, source })?;
                SafeSignature {
                    kind: SignatureKind::Eoa,
                    owner,
                    raw: chunk,
                }
            }
            31 | 32 => {
                let message_hash = eth_sign_hash(safe_tx_hash);
                let owner = recover(r, s, v - 31, &message_hash)
                    .map_err(|source| SignatureError::Recovery { index, source })?;
                SafeSignature {
                    kind: SignatureKind::EthSign,
                    owner,
                    raw: chunk,
                }
            }
            v => return Err(SignatureError::InvalidV { index, v }),
        };
        signatures.push(signature);
        index += 1;
    }
    Ok(signatures)
}

fn recover(
    r: &[u8],
    s: &[u8],
    parity: u8,
    hash: &B256,
) -> Result<Address, alloy_primitives::SignatureError> {
    let signature = Signature::from_scalars_and_parity(
        B256::from_slice(r),
        B256::from_slice(s),
        parity == 1,
    );
    signature.recover_address_from_prehash(hash)
}
