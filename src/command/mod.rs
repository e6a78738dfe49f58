//! Command Lookup
//!
//! Byte trie keyed by upper-cased command names, and the command table
//! that adds arity and subscriber-mode checks on top of it.

mod table;
mod trie;

pub use table::{CommandEntry, CommandTable};
pub use trie::CommandTrie;
