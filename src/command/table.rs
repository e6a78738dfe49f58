//! Command Table
//!
//! Static command registry resolved through `CommandTrie`.

use super::trie::CommandTrie;
use crate::error::CommandError;

/// One registered command. `H` is whatever the dispatcher calls.
#[derive(Debug, Clone)]
pub struct CommandEntry<H> {
    pub name: &'static str,
    /// Inclusive bounds on arguments, command name excluded
    pub min_args: usize,
    pub max_args: usize,
    pub handler: H,
    pub allow_in_sub_mode: bool,
}

/// Read-only command registry
#[derive(Debug)]
pub struct CommandTable<H> {
    trie: CommandTrie<CommandEntry<H>>,
}

impl<H> CommandTable<H> {
    pub fn new(entries: impl IntoIterator<Item = CommandEntry<H>>) -> Self {
        let mut trie = CommandTrie::new();
        for entry in entries {
            trie.add(entry.name.as_bytes(), entry);
        }
        Self { trie }
    }

    pub fn get(&self, name: &[u8]) -> Option<&CommandEntry<H>> {
        self.trie.get(name)
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    /// Look up an upper-cased name and validate the call against it
    ///
    /// # Errors
    ///
    /// Unknown name, argument count outside `[min_args, max_args]`, or a
    /// command not allowed while the connection is subscribed.
    pub fn resolve(
        &self,
        name: &[u8],
        argc: usize,
        subscriber_mode: bool,
    ) -> Result<&CommandEntry<H>, CommandError> {
        let display = || printable(name);

        let entry = self
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(display()))?;

        if argc < entry.min_args || argc > entry.max_args {
            return Err(CommandError::WrongArity(display()));
        }

        if subscriber_mode && !entry.allow_in_sub_mode {
            return Err(CommandError::SubscriberMode(display()));
        }

        Ok(entry)
    }
}

/// Client-supplied name for an error line. CR and LF become spaces so the
/// reply stays a single RESP line.
fn printable(name: &[u8]) -> String {
    String::from_utf8_lossy(name)
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}
