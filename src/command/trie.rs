//! Command Trie
//!
//! 256-way prefix tree over raw bytes. Callers upper-case names before
//! insertion and lookup.

const FANOUT: usize = 256;

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    children: Option<Box<[Option<Box<Node<T>>>; FANOUT]>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            value: None,
            children: None,
        }
    }

    fn child(&self, byte: u8) -> Option<&Node<T>> {
        self.children.as_ref()?[usize::from(byte)].as_deref()
    }

    fn child_or_insert(&mut self, byte: u8) -> &mut Node<T> {
        let children = self
            .children
            .get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
        children[usize::from(byte)].get_or_insert_with(|| Box::new(Node::new()))
    }
}

/// Prefix tree mapping complete byte keys to values.
///
/// Built once, then only read; shared references are safe to use from
/// any thread when `T: Sync`.
#[derive(Debug)]
pub struct CommandTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for CommandTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommandTrie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Insert `value` under `key`, returning the value it replaced
    pub fn add(&mut self, key: &[u8], value: T) -> Option<T> {
        let mut node = &mut self.root;
        for &byte in key {
            node = node.child_or_insert(byte);
        }
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Walk exactly `key.len()` edges and return the value stored there
    pub fn get(&self, key: &[u8]) -> Option<&T> {
        let mut node = &self.root;
        for &byte in key {
            node = node.child(byte)?;
        }
        node.value.as_ref()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
