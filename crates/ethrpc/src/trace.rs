use {
    alloy_primitives::{Address, B256, Bytes, U256},
    alloy_rpc_types_trace::parity::{
        Action, CallType as ParityCallType, LocalizedTransactionTrace, TraceOutput,
    },
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallKind {
    Call,
    DelegateCall,
    StaticCall,
    CallCode,
    Create,
    Create2,
}

/// One call tree entry in the form the indexers consume: the parity trace
/// flattened, with the dotted trace address path precomputed.
#[derive(Clone, Debug)]
pub struct TraceEntry {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub transaction_position: u64,
    /// Dotted path in the call tree, "" for the top level call.
    pub trace_address: String,
    pub kind: CallKind,
    pub from: Address,
    /// For creates this is the deployed contract address from the result.
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub error: Option<String>,
    pub output: Option<Bytes>,
}

impl TraceEntry {
    /// `None` for trace kinds the service does not track (selfdestructs,
    /// block rewards).
    pub fn from_localized(trace: &LocalizedTransactionTrace) -> Option<Self> {
        let transaction_hash = trace.transaction_hash?;
        let block_number = trace.block_number?;
        let transaction_position = trace.transaction_position?;
        let trace_address = dotted(&trace.trace.trace_address);
        let (kind, from, to, value, input) = match &trace.trace.action {
            Action::Call(call) => (
                match call.call_type {
                    ParityCallType::Call | ParityCallType::None => CallKind::Call,
                    ParityCallType::DelegateCall => CallKind::DelegateCall,
                    ParityCallType::StaticCall => CallKind::StaticCall,
                    ParityCallType::CallCode => CallKind::CallCode,
                    _ => CallKind::Call,
                },
                call.from,
                Some(call.to),
                call.value,
                call.input.clone(),
            ),
            Action::Create(create) => {
                let deployed = match &trace.trace.result {
                    Some(TraceOutput::Create(output)) => Some(output.address),
                    _ => None,
                };
                (
                    CallKind::Create,
                    create.from,
                    deployed,
                    create.value,
                    create.init.clone(),
                )
            }
            Action::Selfdestruct(_) | Action::Reward(_) => return None,
        };
        let output = match &trace.trace.result {
            Some(TraceOutput::Call(call)) => Some(call.output.clone()),
            Some(TraceOutput::Create(create)) => Some(create.code.clone()),
            None => None,
        };
        Some(Self {
            transaction_hash,
            block_number,
            transaction_position,
            trace_address,
            kind,
            from,
            to,
            value,
            input,
            error: trace.trace.error.clone(),
            output,
        })
    }

    /// A trace can be decoded and replayed iff its call succeeded and it
    /// actually carries calldata.
    pub fn is_decodable(&self) -> bool {
        self.error.is_none() && !self.input.is_empty()
    }
}

fn dotted(path: &[usize]) -> String {
    path.iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// The parent path of a dotted trace address: drop the last component.
/// `None` for the top level call.
pub fn parent_trace_address(trace_address: &str) -> Option<String> {
    if trace_address.is_empty() {
        return None;
    }
    match trace_address.rsplit_once('.') {
        Some((parent, _)) => Some(parent.to_string()),
        None => Some(String::new()),
    }
}

/// The path of the `index`th child call.
pub fn child_trace_address(trace_address: &str, index: usize) -> String {
    if trace_address.is_empty() {
        index.to_string()
    } else {
        format!("{trace_address}.{index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_paths() {
        assert_eq!(dotted(&[]), "");
        assert_eq!(dotted(&[0]), "0");
        assert_eq!(dotted(&[0, 1, 12]), "0.1.12");
    }

    #[test]
    fn parent_child_arithmetic() {
        assert_eq!(parent_trace_address(""), None);
        assert_eq!(parent_trace_address("0"), Some(String::new()));
        assert_eq!(parent_trace_address("0.1.12"), Some("0.1".to_string()));

        assert_eq!(child_trace_address("", 2), "2");
        assert_eq!(child_trace_address("0.1", 0), "0.1.0");

        // round trip
        let child = child_trace_address("3.4", 5);
        assert_eq!(parent_trace_address(&child), Some("3.4".to_string()));
    }
}
