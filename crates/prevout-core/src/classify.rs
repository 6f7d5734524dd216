//! Address matching over resolved inputs and outputs.

use std::ops::ControlFlow;

use bitcoin::Amount;
use serde::Serialize;

use crate::types::{DetailedHistoryEntry, DetailedTransaction, ResolvedInput, TxOut};

/// The address an output pays to: the single `address` field, else the
/// first legacy `addresses` entry, else none (non-standard scripts).
pub fn output_address(output: &TxOut) -> Option<&str> {
    let spk = &output.script_pub_key;
    spk.address
        .as_deref()
        .filter(|a| !a.is_empty())
        .or_else(|| spk.addresses.first().map(String::as_str))
}

/// Either side of a transaction, matched by the address it is tied to.
#[derive(Debug, Clone, Copy)]
pub enum Element<'a> {
    /// Matched on its resolved prevout's address.
    Input(&'a ResolvedInput),
    Output(&'a TxOut),
}

impl<'a> Element<'a> {
    pub fn address(&self) -> Option<&'a str> {
        match self {
            Element::Input(input) => input.prevout.as_ref().and_then(output_address),
            Element::Output(output) => output_address(output),
        }
    }

    /// Value of the output this element carries or spends.
    pub fn value(&self) -> Option<Amount> {
        match self {
            Element::Input(input) => input.prevout.as_ref().map(|p| p.value),
            Element::Output(output) => Some(output.value),
        }
    }
}

/// Call `visit(element, index)` for each element whose address equals
/// `address`, in order, until `visit` breaks.
pub fn find_matching<'a, I, F>(address: &str, elements: I, mut visit: F)
where
    I: IntoIterator<Item = Element<'a>>,
    F: FnMut(Element<'a>, usize) -> ControlFlow<()>,
{
    for (index, element) in elements.into_iter().enumerate() {
        if element.address() != Some(address) {
            continue;
        }
        if visit(element, index).is_break() {
            break;
        }
    }
}

pub fn outputs(tx: &DetailedTransaction) -> impl Iterator<Item = Element<'_>> {
    tx.vout.iter().map(Element::Output)
}

pub fn inputs(tx: &DetailedTransaction) -> impl Iterator<Item = Element<'_>> {
    tx.vin.iter().map(Element::Input)
}

/// Incoming iff `address` receives one of the transaction's outputs.
pub fn is_incoming(address: &str, tx: &DetailedTransaction) -> bool {
    let mut found = false;
    find_matching(address, outputs(tx), |_, _| {
        found = true;
        ControlFlow::Break(())
    });
    found
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddressTotals {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub sent: Amount,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub received: Amount,
}

/// Sum what `address` received (matching outputs of incoming entries) and
/// sent (matching prevouts of outgoing entries) across `history`.
pub fn totals(address: &str, history: &[DetailedHistoryEntry]) -> AddressTotals {
    let mut totals = AddressTotals::default();
    for entry in history {
        if entry.incoming {
            find_matching(address, outputs(&entry.tx), |element, _| {
                totals.received += element.value().unwrap_or(Amount::ZERO);
                ControlFlow::Continue(())
            });
        } else {
            find_matching(address, inputs(&entry.tx), |element, _| {
                totals.sent += element.value().unwrap_or(Amount::ZERO);
                ControlFlow::Continue(())
            });
        }
    }
    totals
}
