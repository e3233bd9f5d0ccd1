use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const TID_LEN: usize = 8;
const ALPHABET: &[u8; 52] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Task identifier: eight random ascii-alphabetic characters, generated
/// locally by the node that starts the task. Uniqueness is only required
/// within a node's task pool; callers re-roll on collision.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tid(String);

impl Tid {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let tid = (0..TID_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(tid)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Tid {
    fn from(tid: String) -> Self {
        Self(tid)
    }
}

impl From<&str> for Tid {
    fn from(tid: &str) -> Self {
        Self(tid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashSet;

    #[test]
    fn random_tid_shape() {
        for _ in 0..100 {
            let tid = Tid::random();
            assert_eq!(tid.as_str().len(), 8);
            assert!(tid.as_str().chars().all(|c| c.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn random_tids_mostly_unique() {
        // 52^8 values; a thousand draws should never collide
        let tids: HashSet<_> =
            (0..1000).map(|_| Tid::random()).collect();
        assert_eq!(tids.len(), 1000);
    }

    #[test]
    fn serde_transparent() {
        let tid = Tid::from("AbCdEfGh");
        let json = serde_json::to_string(&tid).unwrap();
        assert_eq!(json, "\"AbCdEfGh\"");
        let back: Tid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tid);
    }
}
