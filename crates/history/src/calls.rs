//! Typed view of the persisted decoded-call queue. The decoder stores JSON
//! argument maps; replay wants structured data back. Parsing is strict:
//! a known function with arguments that do not parse marks the call failed
//! and stops the Safe's replay.

use {
    alloy_primitives::{Address, B256, Bytes, U256},
    serde_json::Value,
};

/// The first owner slot in the Safe's owner linked list.
pub const SENTINEL_OWNERS: Address = Address::with_last_byte(0x01);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecArgs {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: u8,
    pub safe_tx_gas: U256,
    pub base_gas: U256,
    pub gas_price: U256,
    pub gas_token: Address,
    pub refund_receiver: Address,
    pub signatures: Bytes,
    /// Only present for synthetic calls built from L2 events, where the
    /// nonce travels in the event instead of being implied by replay order.
    pub nonce: Option<U256>,
    /// Known when the indexer saw the execution outcome (call output or
    /// ExecutionSuccess/Failure events).
    pub failed: Option<bool>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SafeCall {
    Setup {
        owners: Vec<Address>,
        threshold: u64,
        fallback_handler: Option<Address>,
        /// The master copy the proxy points at; injected by the indexer
        /// (trace target or same-transaction ProxyCreation event).
        singleton: Option<Address>,
    },
    AddOwnerWithThreshold {
        owner: Address,
        threshold: Option<u64>,
    },
    RemoveOwner {
        prev_owner: Option<Address>,
        owner: Address,
        threshold: Option<u64>,
    },
    SwapOwner {
        prev_owner: Option<Address>,
        old_owner: Address,
        new_owner: Address,
    },
    ChangeThreshold {
        threshold: u64,
    },
    ChangeMasterCopy {
        master_copy: Address,
    },
    SetFallbackHandler {
        handler: Address,
    },
    SetGuard {
        guard: Address,
    },
    EnableModule {
        module: Address,
    },
    DisableModule {
        module: Address,
    },
    ExecTransaction(Box<ExecArgs>),
    ApproveHash {
        hash: B256,
        /// The caller; injected by the indexer (trace `from` or the event's
        /// indexed owner).
        owner: Option<Address>,
    },
    ExecTransactionFromModule {
        /// The calling module; injected by the indexer from trace context.
        module: Option<Address>,
        to: Address,
        value: U256,
        data: Bytes,
        operation: u8,
        success: Option<bool>,
    },
    /// Selector outside the Safe ABI set: logged and skipped.
    Unknown {
        name: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("argument {0} is missing")]
    Missing(&'static str),
    #[error("argument {key} is malformed: {value}")]
    Malformed { key: &'static str, value: String },
}

fn field<'a>(args: &'a Value, key: &'static str) -> Result<&'a Value, ParseError> {
    match args.get(key) {
        Some(value) => Ok(value),
        None => Err(ParseError::Missing(key)),
    }
}

fn malformed(key: &'static str, value: &Value) -> ParseError {
    ParseError::Malformed {
        key,
        value: value.to_string(),
    }
}

fn addr(args: &Value, key: &'static str) -> Result<Address, ParseError> {
    let value = field(args, key)?;
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(key, value))
}

/// A missing key or a JSON null both mean "not known".
fn opt_addr(args: &Value, key: &'static str) -> Result<Option<Address>, ParseError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| malformed(key, value)),
    }
}

fn uint(args: &Value, key: &'static str) -> Result<U256, ParseError> {
    let value = field(args, key)?;
    value
        .as_str()
        .and_then(|s| U256::from_str_radix(s, 10).ok())
        .ok_or_else(|| malformed(key, value))
}

fn opt_uint(args: &Value, key: &'static str) -> Result<Option<U256>, ParseError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => uint(args, key).map(Some),
    }
}

fn small_uint(args: &Value, key: &'static str) -> Result<u64, ParseError> {
    let value = uint(args, key)?;
    u64::try_from(value).map_err(|_| ParseError::Malformed {
        key,
        value: value.to_string(),
    })
}

fn opt_small_uint(args: &Value, key: &'static str) -> Result<Option<u64>, ParseError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => small_uint(args, key).map(Some),
    }
}

fn bytes(args: &Value, key: &'static str) -> Result<Bytes, ParseError> {
    let value = field(args, key)?;
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(key, value))
}

fn word(args: &Value, key: &'static str) -> Result<B256, ParseError> {
    let value = field(args, key)?;
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(key, value))
}

fn opt_bool(args: &Value, key: &'static str) -> Result<Option<bool>, ParseError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_bool().map(Some).ok_or_else(|| malformed(key, value)),
    }
}

fn operation(args: &Value) -> Result<u8, ParseError> {
    let value = field(args, "operation")?;
    value
        .as_u64()
        .and_then(|op| u8::try_from(op).ok())
        .filter(|op| *op <= 1)
        .ok_or_else(|| malformed("operation", value))
}

pub fn parse(function_name: &str, args: &Value) -> Result<SafeCall, ParseError> {
    let call = match function_name {
        "setup" => {
            let owners_value = field(args, "owners")?;
            let owners = owners_value
                .as_array()
                .ok_or_else(|| malformed("owners", owners_value))?
                .iter()
                .map(|owner| {
                    owner
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| malformed("owners", owner))
                })
                .collect::<Result<Vec<Address>, _>>()?;
            SafeCall::Setup {
                owners,
                threshold: small_uint(args, "threshold")?,
                fallback_handler: opt_addr(args, "fallbackHandler")?,
                singleton: opt_addr(args, "singleton")?,
            }
        }
        "addOwnerWithThreshold" => SafeCall::AddOwnerWithThreshold {
            owner: addr(args, "owner")?,
            threshold: opt_small_uint(args, "threshold")?,
        },
        "removeOwner" => SafeCall::RemoveOwner {
            prev_owner: opt_addr(args, "prevOwner")?,
            owner: addr(args, "owner")?,
            threshold: opt_small_uint(args, "threshold")?,
        },
        "swapOwner" => SafeCall::SwapOwner {
            prev_owner: opt_addr(args, "prevOwner")?,
            old_owner: addr(args, "oldOwner")?,
            new_owner: addr(args, "newOwner")?,
        },
        "changeThreshold" => SafeCall::ChangeThreshold {
            threshold: small_uint(args, "threshold")?,
        },
        "changeMasterCopy" => SafeCall::ChangeMasterCopy {
            master_copy: addr(args, "masterCopy")?,
        },
        "setFallbackHandler" => SafeCall::SetFallbackHandler {
            handler: addr(args, "handler")?,
        },
        "setGuard" => SafeCall::SetGuard {
            guard: addr(args, "guard")?,
        },
        "enableModule" => SafeCall::EnableModule {
            module: addr(args, "module")?,
        },
        "disableModule" => SafeCall::DisableModule {
            module: addr(args, "module")?,
        },
        "execTransaction" => SafeCall::ExecTransaction(Box::new(ExecArgs {
            to: addr(args, "to")?,
            value: uint(args, "value")?,
            data: bytes(args, "data")?,
            operation: operation(args)?,
            safe_tx_gas: uint(args, "safeTxGas")?,
            base_gas: uint(args, "baseGas")?,
            gas_price: uint(args, "gasPrice")?,
            gas_token: addr(args, "gasToken")?,
            refund_receiver: addr(args, "refundReceiver")?,
            signatures: bytes(args, "signatures")?,
            nonce: opt_uint(args, "nonce")?,
            failed: opt_bool(args, "failed")?,
        })),
        "approveHash" => SafeCall::ApproveHash {
            hash: word(args, "hashToApprove")?,
            owner: opt_addr(args, "owner")?,
        },
        "execTransactionFromModule" | "execTransactionFromModuleReturnData" => {
            SafeCall::ExecTransactionFromModule {
                module: opt_addr(args, "module")?,
                to: addr(args, "to")?,
                value: uint(args, "value")?,
                data: bytes(args, "data")?,
                operation: operation(args)?,
                success: opt_bool(args, "success")?,
            }
        }
        other => SafeCall::Unknown {
            name: other.to_string(),
        },
    };
    Ok(call)
}
