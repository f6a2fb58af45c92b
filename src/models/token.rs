// Token algebra - branch lineage for parallel gateways

//! # Tokens
//!
//! Every task carries a [`Token`]: a path string recording each split the
//! task's branch passed through. A process starts with the token `start`;
//! a Split task with id `7` hands its branches `start/7_1`, `start/7_2`, …
//! and a nested split inside the second branch (task `12`) produces
//! `start/7_2/12_1`, `start/7_2/12_2`, and so on.
//!
//! Join gateways use two derived values:
//! - the **base split token** (`start/7_2/12_1` → `start/7_2`) becomes the
//!   Join task's own token, so the branch continues at the outer level
//! - the **common split prefix** (`start/7_2/12_1` → `start/7_2/12_`) is
//!   shared by every sibling minted by the same Split task, including tasks
//!   deeper inside those branches
//!
//! ## Rust Learning Notes:
//!
//! ### Newtype Pattern
//! `Token(String)` wraps a plain string so the compiler keeps tokens apart
//! from node names, references and other strings. `#[serde(transparent)]`
//! keeps the JSON representation a bare string.
//!
//! ### Iterators Instead of Generators
//! [`SplitTokenSource`] implements `Iterator`, so a Split can `.take(n)` or
//! `.next()` exactly as many tokens as it has live branches. A fresh source
//! is built for every Split activation; nothing is shared between calls.

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

const START: &str = "start";

/// Hierarchical branch identifier assigned to a task at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// The token every process starts with.
    pub fn start() -> Self {
        Token(START.to_string())
    }

    /// Wrap an already-formatted token string (e.g. loaded from storage).
    pub fn new<S: Into<String>>(value: S) -> Self {
        Token(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True once the token has passed at least one split.
    pub fn is_split_token(&self) -> bool {
        self.0.contains('/')
    }

    /// The token the originating Split task held.
    ///
    /// Tokens that never passed a split are returned unchanged.
    ///
    /// ```rust
    /// # use flowkeeper::Token;
    /// let token = Token::new("start/7_2/12_1");
    /// assert_eq!(token.base_split_token(), Token::new("start/7_2"));
    /// ```
    pub fn base_split_token(&self) -> Token {
        match self.0.rsplit_once('/') {
            Some((base, _)) => Token(base.to_string()),
            None => self.clone(),
        }
    }

    /// Prefix shared by every sibling spawned by the same Split task.
    ///
    /// ```rust
    /// # use flowkeeper::Token;
    /// let token = Token::new("start/7_2/12_1");
    /// assert_eq!(token.common_split_prefix(), "start/7_2/12_");
    /// ```
    pub fn common_split_prefix(&self) -> String {
        let Some((base, last)) = self.0.rsplit_once('/') else {
            return self.0.clone();
        };
        match last.rsplit_once('_') {
            Some((split_task, _)) => format!("{}/{}_", base, split_task),
            None => self.0.clone(),
        }
    }

    /// Number of splits this token passed through.
    pub fn depth(&self) -> usize {
        self.0.matches('/').count()
    }

    /// Start a fresh sequence of branch tokens for a Split task.
    pub fn split_token_source(&self, split_task: TaskId) -> SplitTokenSource {
        SplitTokenSource::new(self, split_task)
    }
}

impl Default for Token {
    fn default() -> Self {
        Token::start()
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Token(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Token(s)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Endless supply of `"{parent}/{split_task}_{n}"` tokens, n = 1, 2, 3, …
#[derive(Debug, Clone)]
pub struct SplitTokenSource {
    prefix: String,
    next_index: u64,
}

impl SplitTokenSource {
    pub fn new(parent: &Token, split_task: TaskId) -> Self {
        Self {
            prefix: format!("{}/{}_", parent.as_str(), split_task),
            next_index: 1,
        }
    }

    /// The common split prefix every produced token shares.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Iterator for SplitTokenSource {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let token = Token(format!("{}{}", self.prefix, self.next_index));
        self.next_index += 1;
        Some(token)
    }
}
