//! Binary trie over 32-bit IPv4 keys.
//!
//! Nodes live in an index arena. Freed nodes are chained through their `right`
//! slot and handed out again before the arena grows, so churn on single-host
//! entries does not grow memory.

const ROOT: usize = 0;
const TOP_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, Default)]
struct Node {
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
    value: Option<String>,
}

impl Node {
    fn child(&self, key: u32, bit: u32) -> Option<usize> {
        if key & bit != 0 {
            self.right
        } else {
            self.left
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct CidrTrie {
    nodes: Vec<Node>,
    free: Option<usize>,
    free_len: usize,
    values: usize,
}

impl Default for CidrTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl CidrTrie {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            free: None,
            free_len: 0,
            values: 0,
        }
    }

    /// Number of prefixes holding a value.
    pub fn len(&self) -> usize {
        self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values == 0
    }

    /// Live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free_len
    }

    fn alloc(&mut self, parent: usize) -> usize {
        let node = Node {
            parent: Some(parent),
            ..Node::default()
        };
        match self.free {
            Some(idx) => {
                self.free = self.nodes[idx].right;
                self.free_len -= 1;
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx] = Node {
            right: self.free,
            ..Node::default()
        };
        self.free = Some(idx);
        self.free_len += 1;
    }

    /// Store `value` at the node for `key`/`mask`, overwriting any previous value.
    pub fn insert(&mut self, key: u32, mask: u32, value: String) {
        let mut node = ROOT;
        let mut bit = TOP_BIT;

        while bit & mask != 0 {
            match self.nodes[node].child(key, bit) {
                Some(next) => {
                    node = next;
                    bit >>= 1;
                }
                None => break,
            }
        }

        while bit & mask != 0 {
            let next = self.alloc(node);
            if key & bit != 0 {
                self.nodes[node].right = Some(next);
            } else {
                self.nodes[node].left = Some(next);
            }
            node = next;
            bit >>= 1;
        }

        if self.nodes[node].value.replace(value).is_none() {
            self.values += 1;
        }
    }

    /// Most specific value on the path of `key`.
    pub fn search(&self, key: u32) -> Option<&str> {
        let mut found = None;
        let mut bit = TOP_BIT;
        let mut cursor = Some(ROOT);

        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            if let Some(value) = node.value.as_deref() {
                found = Some(value);
            }
            if bit == 0 {
                break;
            }
            cursor = node.child(key, bit);
            bit >>= 1;
        }

        found
    }

    /// Remove the value stored at exactly `key`/`mask`.
    ///
    /// Returns false when no value lives at that prefix.
    pub fn remove(&mut self, key: u32, mask: u32) -> bool {
        let mut node = ROOT;
        let mut bit = TOP_BIT;

        while bit & mask != 0 {
            match self.nodes[node].child(key, bit) {
                Some(next) => node = next,
                None => return false,
            }
            bit >>= 1;
        }

        if self.nodes[node].value.take().is_none() {
            return false;
        }
        self.values -= 1;

        // Interior nodes and the root stay as waypoints.
        if node == ROOT || !self.nodes[node].is_leaf() {
            return true;
        }

        let mut current = node;
        while let Some(parent) = self.nodes[current].parent {
            if self.nodes[parent].right == Some(current) {
                self.nodes[parent].right = None;
            } else {
                self.nodes[parent].left = None;
            }
            self.release(current);

            current = parent;
            let node = &self.nodes[current];
            if !node.is_leaf() || node.value.is_some() || node.parent.is_none() {
                break;
            }
        }

        true
    }
}
