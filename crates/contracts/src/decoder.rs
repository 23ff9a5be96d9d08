//! Selector registry for the Safe ABI set. Decoding yields a JSON argument
//! map so the replay queue can be persisted and consumed without carrying
//! generated types through the database.

use {
    crate::{ISafe, ISafeV100, IMultiSend, multisend},
    alloy_primitives::{Address, B256, Bytes, U256},
    alloy_sol_types::SolCall,
    serde_json::{Value, json},
};

/// Outcome of running calldata through the registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DecodedCall {
    /// The selector is not part of the Safe ABI set. Such calls are logged
    /// and skipped; they never stop a replay.
    Unknown { selector: [u8; 4] },
    Known {
        name: &'static str,
        arguments: Value,
    },
}

impl DecodedCall {
    pub fn known(&self) -> Option<(&'static str, &Value)> {
        match self {
            Self::Known { name, arguments } => Some((name, arguments)),
            Self::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("calldata shorter than a selector")]
    MissingSelector,
    /// The selector matched a known function but the arguments do not abi
    /// decode. The caller marks the originating call failed.
    #[error("malformed arguments for {name}: {source}")]
    Malformed {
        name: &'static str,
        #[source]
        source: alloy_sol_types::Error,
    },
}

fn addr(value: Address) -> Value {
    Value::String(value.to_string())
}

fn uint(value: U256) -> Value {
    Value::String(value.to_string())
}

fn word(value: B256) -> Value {
    Value::String(format!("{value}"))
}

fn bytes(value: &Bytes) -> Value {
    Value::String(format!("0x{}", hex::encode(value)))
}

fn decode_as<C: SolCall>(
    name: &'static str,
    data: &[u8],
    to_json: impl FnOnce(C) -> Value,
) -> Result<DecodedCall, DecodeError> {
    let call = C::abi_decode(data).map_err(|source| DecodeError::Malformed { name, source })?;
    Ok(DecodedCall::Known {
        name,
        arguments: to_json(call),
    })
}

/// Decodes Safe-targeted calldata. Nested MultiSend payloads are decoded one
/// level deep, which covers the batches wallets actually build; deeper
/// nesting falls back to raw bytes.
pub fn decode(data: &[u8]) -> Result<DecodedCall, DecodeError> {
    decode_inner(data, 1)
}

fn decode_inner(data: &[u8], multisend_depth: u8) -> Result<DecodedCall, DecodeError> {
    let selector: [u8; 4] = data
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::MissingSelector)?;

    match selector {
        s if s == ISafe::setupCall::SELECTOR => decode_as("setup", data, |c: ISafe::setupCall| {
            json!({
                "owners": c._owners.iter().copied().map(addr).collect::<Vec<_>>(),
                "threshold": uint(c._threshold),
                "to": addr(c.to),
                "data": bytes(&c.data),
                "fallbackHandler": addr(c.fallbackHandler),
                "paymentToken": addr(c.paymentToken),
                "payment": uint(c.payment),
                "paymentReceiver": addr(c.paymentReceiver),
            })
        }),
        s if s == ISafeV100::setupCall::SELECTOR => {
            decode_as("setup", data, |c: ISafeV100::setupCall| {
                json!({
                    "owners": c._owners.iter().copied().map(addr).collect::<Vec<_>>(),
                    "threshold": uint(c._threshold),
                    "to": addr(c.to),
                    "data": bytes(&c.data),
                })
            })
        }
        s if s == ISafe::execTransactionCall::SELECTOR => {
            decode_as("execTransaction", data, |c: ISafe::execTransactionCall| {
                json!({
                    "to": addr(c.to),
                    "value": uint(c.value),
                    "data": bytes(&c.data),
                    "operation": c.operation,
                    "safeTxGas": uint(c.safeTxGas),
                    "baseGas": uint(c.baseGas),
                    "gasPrice": uint(c.gasPrice),
                    "gasToken": addr(c.gasToken),
                    "refundReceiver": addr(c.refundReceiver),
                    "signatures": bytes(&c.signatures),
                })
            })
        }
        s if s == ISafe::approveHashCall::SELECTOR => {
            decode_as("approveHash", data, |c: ISafe::approveHashCall| {
                json!({ "hashToApprove": word(c.hashToApprove) })
            })
        }
        s if s == ISafe::addOwnerWithThresholdCall::SELECTOR => decode_as(
            "addOwnerWithThreshold",
            data,
            |c: ISafe::addOwnerWithThresholdCall| {
                json!({ "owner": addr(c.owner), "threshold": uint(c._threshold) })
            },
        ),
        s if s == ISafe::removeOwnerCall::SELECTOR => {
            decode_as("removeOwner", data, |c: ISafe::removeOwnerCall| {
                json!({
                    "prevOwner": addr(c.prevOwner),
                    "owner": addr(c.owner),
                    "threshold": uint(c._threshold),
                })
            })
        }
        s if s == ISafe::swapOwnerCall::SELECTOR => {
            decode_as("swapOwner", data, |c: ISafe::swapOwnerCall| {
                json!({
                    "prevOwner": addr(c.prevOwner),
                    "oldOwner": addr(c.oldOwner),
                    "newOwner": addr(c.newOwner),
                })
            })
        }
        s if s == ISafe::changeThresholdCall::SELECTOR => {
            decode_as("changeThreshold", data, |c: ISafe::changeThresholdCall| {
                json!({ "threshold": uint(c._threshold) })
            })
        }
        s if s == ISafe::changeMasterCopyCall::SELECTOR => {
            decode_as("changeMasterCopy", data, |c: ISafe::changeMasterCopyCall| {
                json!({ "masterCopy": addr(c._masterCopy) })
            })
        }
        s if s == ISafe::setFallbackHandlerCall::SELECTOR => decode_as(
            "setFallbackHandler",
            data,
            |c: ISafe::setFallbackHandlerCall| json!({ "handler": addr(c.handler) }),
        ),
        s if s == ISafe::setGuardCall::SELECTOR => {
            decode_as("setGuard", data, |c: ISafe::setGuardCall| {
                json!({ "guard": addr(c.guard) })
            })
        }
        s if s == ISafe::enableModuleCall::SELECTOR => {
            decode_as("enableModule", data, |c: ISafe::enableModuleCall| {
                json!({ "module": addr(c.module) })
            })
        }
        s if s == ISafe::disableModuleCall::SELECTOR => {
            decode_as("disableModule", data, |c: ISafe::disableModuleCall| {
                json!({ "prevModule": addr(c.prevModule), "module": addr(c.module) })
            })
        }
        s if s == ISafe::execTransactionFromModuleCall::SELECTOR => decode_as(
            "execTransactionFromModule",
            data,
            |c: ISafe::execTransactionFromModuleCall| {
                json!({
                    "to": addr(c.to),
                    "value": uint(c.value),
                    "data": bytes(&c.data),
                    "operation": c.operation,
                })
            },
        ),
        s if s == ISafe::execTransactionFromModuleReturnDataCall::SELECTOR => decode_as(
            "execTransactionFromModuleReturnData",
            data,
            |c: ISafe::execTransactionFromModuleReturnDataCall| {
                json!({
                    "to": addr(c.to),
                    "value": uint(c.value),
                    "data": bytes(&c.data),
                    "operation": c.operation,
                })
            },
        ),
        s if s == IMultiSend::multiSendCall::SELECTOR => {
            let call = IMultiSend::multiSendCall::abi_decode(data).map_err(|source| {
                DecodeError::Malformed {
                    name: "multiSend",
                    source,
                }
            })?;
            let txs = multisend::decode(&call.transactions).map_err(|_| {
                DecodeError::Malformed {
                    name: "multiSend",
                    source: alloy_sol_types::Error::Overrun,
                }
            })?;
            let transactions = txs
                .iter()
                .map(|tx| {
                    let mut entry = json!({
                        "operation": tx.operation,
                        "to": addr(tx.to),
                        "value": uint(tx.value),
                        "data": bytes(&tx.data),
                    });
                    if multisend_depth > 0
                        && let Ok(DecodedCall::Known { name, arguments }) =
                            decode_inner(&tx.data, multisend_depth - 1)
                    {
                        entry["dataDecoded"] = json!({
                            "method": name,
                            "parameters": arguments,
                        });
                    }
                    entry
                })
                .collect::<Vec<_>>();
            Ok(DecodedCall::Known {
                name: "multiSend",
                arguments: json!({ "transactions": transactions }),
            })
        }
        selector => Ok(DecodedCall::Unknown { selector }),
    }
}
