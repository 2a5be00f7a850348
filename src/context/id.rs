//! Context id format: `"<node>-<seq>"`. `node` is an 8-character random
//! token fixed for the process lifetime; `seq` is a monotonic per-process
//! counter (§4.2).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContextId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub(crate) struct IdGenerator {
    node: String,
    seq: AtomicU64,
}

impl IdGenerator {
    pub(crate) fn new() -> Self {
        IdGenerator {
            node: random_node_token(),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn next(&self) -> ContextId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        ContextId(format!("{}-{}", self.node, seq))
    }
}

fn random_node_token() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_share_node_prefix() {
        let gen = IdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        let node_a = a.0.split('-').next().unwrap();
        let node_b = b.0.split('-').next().unwrap();
        assert_eq!(node_a, node_b);
        assert_eq!(node_a.len(), 8);
    }
}
