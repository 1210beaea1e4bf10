//! Shared test fixtures: an operation kind and the JSON definitions under
//! `fixtures/`.

use serde::{Deserialize, Serialize};

use crate::definitions::ThrottleDefinitions;

/// The operation kinds the fixtures mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum Op {
    CryptoTransfer,
    CryptoCreate,
    CryptoGetAccountBalance,
    ContractCall,
    TokenMint,
    TokenCreate,
    TokenAssociateToAccount,
    TransactionGetReceipt,
    FileCreate,
}

pub(crate) fn raw(name: &str) -> &'static str {
    match name {
        "throttles.json" => include_str!("../fixtures/throttles.json"),
        "throttles-repeating.json" => include_str!("../fixtures/throttles-repeating.json"),
        "insufficient-capacity-throttles.json" => {
            include_str!("../fixtures/insufficient-capacity-throttles.json")
        }
        "overdone-throttles.json" => include_str!("../fixtures/overdone-throttles.json"),
        "undersupplied-throttles.json" => include_str!("../fixtures/undersupplied-throttles.json"),
        "never-true-throttles.json" => include_str!("../fixtures/never-true-throttles.json"),
        "overflow-throttles.json" => include_str!("../fixtures/overflow-throttles.json"),
        "repeated-op-throttles.json" => include_str!("../fixtures/repeated-op-throttles.json"),
        _ => panic!("no fixture named {name}"),
    }
}

pub(crate) fn definitions(name: &str) -> ThrottleDefinitions<Op> {
    ThrottleDefinitions::from_json_str(raw(name)).unwrap()
}
