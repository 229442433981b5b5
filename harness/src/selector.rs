//! Resolve selectors into the nodes (and accounts) a command is sent to.
//!
//! Grammar, first match wins:
//!
//! 1. `1,0,2`: one target per listed node (in the order written), with no account.
//! 2. `alice`: node 1 as `alice`.
//! 3. `bob`: node 2 as `bob`.
//! 4. `delegates`: every delegate ordinal `i` on its hosting node as `init<i>`.
//! 5. `angel`: node 0 as `init0` (the genesis-funded account).
//! 6. `none`: nothing.
//! 7. Anything else: nothing. This includes malformed node lists such as `3abc` or `1,,2`.
//!
//! Unrecognized selectors resolve to nothing instead of an error so that an interactive session
//! can start without an active selector.

use crate::Error;
use serde_json::Value;
use tracing::warn;

/// Number of delegates in genesis.
pub const DELEGATE_COUNT: usize = 101;

/// Token replaced with a target's account name.
pub const ACCOUNT_PLACEHOLDER: &str = "$acct";

/// Account name of delegate `ordinal`.
pub fn delegate_name(ordinal: usize) -> String {
    format!("init{ordinal}")
}

/// A node (and the account on it) that should receive a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub node: usize,
    pub account: String,
}

impl Target {
    fn new(node: usize, account: impl Into<String>) -> Self {
        Self {
            node,
            account: account.into(),
        }
    }
}

/// Resolves selectors using a delegate to node table.
#[derive(Clone, Debug)]
pub struct Resolver {
    delegates: Vec<usize>,
}

impl Resolver {
    /// `delegates[i]` is the node hosting delegate `i`.
    pub fn new(delegates: Vec<usize>) -> Self {
        Self { delegates }
    }

    /// Node hosting each delegate ordinal.
    pub fn delegates(&self) -> &[usize] {
        &self.delegates
    }

    /// Node hosting delegate `ordinal`.
    pub fn delegate_node(&self, ordinal: usize) -> Option<usize> {
        self.delegates.get(ordinal).copied()
    }

    pub fn resolve(&self, selector: &str) -> Vec<Target> {
        if let Some(nodes) = digit_list(selector) {
            return nodes
                .into_iter()
                .map(|node| Target::new(node, ""))
                .collect();
        }
        match selector {
            "alice" => vec![Target::new(1, "alice")],
            "bob" => vec![Target::new(2, "bob")],
            "delegates" => self
                .delegates
                .iter()
                .enumerate()
                .map(|(ordinal, node)| Target::new(*node, delegate_name(ordinal)))
                .collect(),
            "angel" => vec![Target::new(0, delegate_name(0))],
            "none" => Vec::new(),
            _ => {
                if selector.trim_start().starts_with(|c: char| c.is_ascii_digit()) {
                    warn!(selector, "malformed node list");
                }
                Vec::new()
            }
        }
    }
}

/// Parse `selector` as comma separated node indices.
///
/// Every part must be a run of digits (surrounding whitespace allowed), otherwise the
/// selector is not a node list at all.
fn digit_list(selector: &str) -> Option<Vec<usize>> {
    selector
        .split(',')
        .map(|part| {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            part.parse().ok()
        })
        .collect()
}

/// Split a command template into its method and parameters, replacing [ACCOUNT_PLACEHOLDER]
/// with `account`.
///
/// Tokens are separated by whitespace. A token that is exactly the placeholder is kept as a
/// parameter even when `account` is empty, so positional parameters never shift.
pub fn prepare(template: &str, account: &str) -> Result<(String, Vec<Value>), Error> {
    let mut tokens = template
        .split_whitespace()
        .map(|token| token.replace(ACCOUNT_PLACEHOLDER, account));
    let method = tokens.next().ok_or(Error::EmptyCommand)?;
    if method.is_empty() {
        return Err(Error::EmptyCommand);
    }
    Ok((method, tokens.map(Value::String).collect()))
}
