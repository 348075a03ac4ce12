use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{EngineError, EngineResult};

/// Transaction identifier: content hash of a tree clock value at the moment
/// of the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(pub String);

impl Tid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Tid {
    fn from(s: &str) -> Self {
        Tid(s.to_string())
    }
}

/// Path from the clock root to a process's id leaf: one char per branch,
/// `l` or `r`. The genesis process has the empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessPath(pub String);

impl ProcessPath {
    pub fn root() -> Self {
        ProcessPath(String::new())
    }

    pub fn is_prefix_of(&self, other: &ProcessPath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Immediate ancestor path, or `None` at the root.
    pub fn parent(&self) -> Option<ProcessPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(ProcessPath(self.0[..self.0.len() - 1].to_string()))
        }
    }
}

impl fmt::Display for ProcessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Leaf { ticks: u64, id: bool },
    Branch { ticks: u64, left: Box<Node>, right: Box<Node> },
}

impl Node {
    fn ticks(&self) -> u64 {
        match self {
            Node::Leaf { ticks, .. } => *ticks,
            Node::Branch { ticks, .. } => *ticks,
        }
    }

    /// Sum of every counter in the subtree.
    fn total(&self) -> u64 {
        match self {
            Node::Leaf { ticks, .. } => *ticks,
            Node::Branch { ticks, left, right } => ticks + left.total() + right.total(),
        }
    }

    fn strip_id(&self) -> Node {
        match self {
            Node::Leaf { ticks, .. } => Node::Leaf { ticks: *ticks, id: false },
            Node::Branch { ticks, left, right } => Node::Branch {
                ticks: *ticks,
                left: Box::new(left.strip_id()),
                right: Box::new(right.strip_id()),
            },
        }
    }
}

/// A tree-structured logical clock. Immutable: every operation returns a new
/// clock value. Exactly one leaf carries the identity of the owning process.
///
/// Forking splits the id leaf in two, so process identities are paths in the
/// tree; ticking increments only the id leaf; updating takes the
/// component-wise maximum against another clock. Well-formedness invariant:
/// all clocks of a domain descend from one genesis by forks, so any branch
/// node shared by two clocks carries the same counter (frozen at the fork).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeClock {
    root: Node,
}

impl TreeClock {
    /// The single-node clock `(0, id=root)` that bootstraps a domain.
    pub fn genesis() -> Self {
        TreeClock {
            root: Node::Leaf { ticks: 0, id: true },
        }
    }

    /// Sum of every counter in the clock: all events known, own and
    /// observed. This is the clone's externally reported tick count.
    pub fn all_ticks(&self) -> u64 {
        self.root.total()
    }

    /// Total ticks along the path from the root to the id leaf.
    pub fn ticks(&self) -> u64 {
        let mut sum = 0;
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { ticks, .. } => return sum + ticks,
                Node::Branch { ticks, left, right } => {
                    sum += ticks;
                    node = if Self::contains_id(left) { left } else { right };
                }
            }
        }
    }

    fn contains_id(node: &Node) -> bool {
        match node {
            Node::Leaf { id, .. } => *id,
            Node::Branch { left, right, .. } => {
                Self::contains_id(left) || Self::contains_id(right)
            }
        }
    }

    /// True if the id leaf has never been ticked since it was forked.
    pub fn is_zero_id(&self) -> bool {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { ticks, .. } => return *ticks == 0,
                Node::Branch { left, right, .. } => {
                    node = if Self::contains_id(left) { left } else { right };
                }
            }
        }
    }

    /// The id leaf's position in the tree.
    pub fn process_path(&self) -> ProcessPath {
        let mut path = String::new();
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { .. } => return ProcessPath(path),
                Node::Branch { left, right, .. } => {
                    if Self::contains_id(left) {
                        path.push('l');
                        node = left;
                    } else {
                        path.push('r');
                        node = right;
                    }
                }
            }
        }
    }

    /// New clock with the id leaf incremented by one.
    pub fn ticked(&self) -> TreeClock {
        fn tick(node: &Node) -> Node {
            match node {
                Node::Leaf { ticks, id: true } => Node::Leaf { ticks: ticks + 1, id: true },
                Node::Leaf { ticks, id: false } => Node::Leaf { ticks: *ticks, id: false },
                Node::Branch { ticks, left, right } => {
                    if TreeClock::contains_id(left) {
                        Node::Branch {
                            ticks: *ticks,
                            left: Box::new(tick(left)),
                            right: right.clone(),
                        }
                    } else {
                        Node::Branch {
                            ticks: *ticks,
                            left: left.clone(),
                            right: Box::new(tick(right)),
                        }
                    }
                }
            }
        }
        TreeClock { root: tick(&self.root) }
    }

    /// Splits the id leaf into two sub-leaves. The caller retains the left
    /// identity; the right is handed to a new participant. All other
    /// counters are preserved in both results.
    pub fn forked(&self) -> (TreeClock, TreeClock) {
        fn fork(node: &Node, keep_left: bool) -> Node {
            match node {
                Node::Leaf { ticks, id: true } => Node::Branch {
                    ticks: *ticks,
                    left: Box::new(Node::Leaf { ticks: 0, id: keep_left }),
                    right: Box::new(Node::Leaf { ticks: 0, id: !keep_left }),
                },
                Node::Leaf { ticks, id: false } => Node::Leaf { ticks: *ticks, id: false },
                Node::Branch { ticks, left, right } => {
                    if TreeClock::contains_id(left) {
                        Node::Branch {
                            ticks: *ticks,
                            left: Box::new(fork(left, keep_left)),
                            right: right.clone(),
                        }
                    } else {
                        Node::Branch {
                            ticks: *ticks,
                            left: left.clone(),
                            right: Box::new(fork(right, keep_left)),
                        }
                    }
                }
            }
        }
        (
            TreeClock { root: fork(&self.root, true) },
            TreeClock { root: fork(&self.root, false) },
        )
    }

    /// Component-wise maximum against another clock. The result adopts the
    /// finer tree shape wherever the two differ; the id remains the
    /// caller's.
    pub fn update(&self, other: &TreeClock) -> TreeClock {
        fn merge(a: &Node, b: &Node) -> Node {
            match (a, b) {
                (Node::Leaf { ticks: ta, id }, Node::Leaf { ticks: tb, .. }) => Node::Leaf {
                    ticks: (*ta).max(*tb),
                    id: *id,
                },
                // The other clock has observed a fork we have not: adopt its
                // refinement. Our coarse counter is covered by the frozen
                // branch counter.
                (Node::Leaf { id, .. }, Node::Branch { ticks, left, right }) => {
                    debug_assert!(!*id, "own id position forked by a peer clock");
                    Node::Branch {
                        ticks: *ticks,
                        left: Box::new(left.strip_id()),
                        right: Box::new(right.strip_id()),
                    }
                }
                // The other clock is coarser than us; its leaf counter is
                // bounded by our frozen branch counter.
                (Node::Branch { .. }, Node::Leaf { .. }) => a.clone(),
                (
                    Node::Branch { ticks: ta, left: la, right: ra },
                    Node::Branch { ticks: tb, left: lb, right: rb },
                ) => Node::Branch {
                    ticks: (*ta).max(*tb),
                    left: Box::new(merge(la, lb)),
                    right: Box::new(merge(ra, rb)),
                },
            }
        }
        TreeClock {
            root: merge(&self.root, &other.root),
        }
    }

    /// Ticks along `other`'s id path, evaluated against this clock: how many
    /// of `other`'s process events this clock has seen.
    pub fn get_ticks(&self, other: &TreeClock) -> u64 {
        self.ticks_along(&other.process_path())
    }

    /// Path sum along an arbitrary process path. Terminates early if this
    /// clock has not observed a fork on that path.
    pub fn ticks_along(&self, path: &ProcessPath) -> u64 {
        let mut sum = 0;
        let mut node = &self.root;
        for step in path.0.chars() {
            match node {
                Node::Leaf { ticks, .. } => return sum + ticks,
                Node::Branch { ticks, left, right } => {
                    sum += ticks;
                    node = if step == 'l' { left } else { right };
                }
            }
        }
        sum + node.ticks()
    }

    /// True iff some component of self is strictly less than the
    /// corresponding component of `other`, comparing path sums on the common
    /// refinement of the two shapes.
    pub fn any_lt(&self, other: &TreeClock) -> bool {
        Self::cmp_any(&self.root, &other.root, 0, 0, &|a, b| a < b, None, "")
    }

    /// True iff some component of self is strictly greater.
    pub fn any_gt(&self, other: &TreeClock) -> bool {
        Self::cmp_any(&self.root, &other.root, 0, 0, &|a, b| a > b, None, "")
    }

    /// `any_gt` with every position under this clock's own id subtree
    /// excluded. Used by causal delivery: the sender's own counter is
    /// checked by tick contiguity, not by domination.
    pub(crate) fn any_gt_non_id(&self, other: &TreeClock) -> bool {
        let skip = self.process_path();
        Self::cmp_any(&self.root, &other.root, 0, 0, &|a, b| a > b, Some(&skip.0), "")
    }

    fn cmp_any(
        a: &Node,
        b: &Node,
        acc_a: u64,
        acc_b: u64,
        cmp: &dyn Fn(u64, u64) -> bool,
        skip: Option<&str>,
        at: &str,
    ) -> bool {
        if let Some(skip) = skip {
            if at.starts_with(skip) {
                return false;
            }
        }
        const ZERO: Node = Node::Leaf { ticks: 0, id: false };
        match (a, b) {
            (Node::Leaf { ticks: ta, .. }, Node::Leaf { ticks: tb, .. }) => {
                cmp(acc_a + ta, acc_b + tb)
            }
            (Node::Leaf { ticks: ta, .. }, Node::Branch { ticks: tb, left, right }) => {
                Self::cmp_any(&ZERO, left, acc_a + ta, acc_b + tb, cmp, skip, &format!("{}l", at))
                    || Self::cmp_any(&ZERO, right, acc_a + ta, acc_b + tb, cmp, skip, &format!("{}r", at))
            }
            (Node::Branch { ticks: ta, left, right }, Node::Leaf { ticks: tb, .. }) => {
                Self::cmp_any(left, &ZERO, acc_a + ta, acc_b + tb, cmp, skip, &format!("{}l", at))
                    || Self::cmp_any(right, &ZERO, acc_a + ta, acc_b + tb, cmp, skip, &format!("{}r", at))
            }
            (
                Node::Branch { ticks: ta, left: la, right: ra },
                Node::Branch { ticks: tb, left: lb, right: rb },
            ) => {
                Self::cmp_any(la, lb, acc_a + ta, acc_b + tb, cmp, skip, &format!("{}l", at))
                    || Self::cmp_any(ra, rb, acc_a + ta, acc_b + tb, cmp, skip, &format!("{}r", at))
            }
        }
    }

    /// Content hash of the clock value. The id marker is excluded: the hash
    /// is a function of counters and shape only.
    pub fn hash(&self) -> Tid {
        fn pack(node: &Node, out: &mut Vec<u8>) {
            match node {
                Node::Leaf { ticks, .. } => {
                    out.push(0);
                    out.extend_from_slice(&ticks.to_be_bytes());
                }
                Node::Branch { ticks, left, right } => {
                    out.push(1);
                    out.extend_from_slice(&ticks.to_be_bytes());
                    pack(left, out);
                    pack(right, out);
                }
            }
        }
        let mut bytes = Vec::new();
        pack(&self.root, &mut bytes);
        let digest = Sha256::digest(&bytes);
        Tid(URL_SAFE_NO_PAD.encode(&digest[..16]))
    }

    /// Canonical JSON form: a non-id leaf is its counter, the id leaf is
    /// `["id", counter]`, a branch is `[counter, left, right]`.
    pub fn to_json(&self) -> Value {
        fn encode(node: &Node) -> Value {
            match node {
                Node::Leaf { ticks, id: false } => json!(ticks),
                Node::Leaf { ticks, id: true } => json!(["id", ticks]),
                Node::Branch { ticks, left, right } => {
                    json!([ticks, encode(left), encode(right)])
                }
            }
        }
        encode(&self.root)
    }

    /// Inverse of `to_json`; total over valid inputs, `BadClock` otherwise.
    pub fn from_json(value: &Value) -> EngineResult<TreeClock> {
        let root = Self::decode(value)?;
        let clock = TreeClock { root };
        if !Self::contains_id(&clock.root) {
            return Err(EngineError::BadClock("no id leaf".to_string()));
        }
        Ok(clock)
    }

    fn decode(value: &Value) -> EngineResult<Node> {
        let bad = |msg: &str| EngineError::BadClock(format!("{}: {}", msg, value));
        match value {
            Value::Number(n) => {
                let ticks = n.as_u64().ok_or_else(|| bad("negative counter"))?;
                Ok(Node::Leaf { ticks, id: false })
            }
            Value::Array(items) => match items.as_slice() {
                [Value::String(tag), Value::Number(n)] if tag == "id" => {
                    let ticks = n.as_u64().ok_or_else(|| bad("negative counter"))?;
                    Ok(Node::Leaf { ticks, id: true })
                }
                [Value::Number(n), left, right] => {
                    let ticks = n.as_u64().ok_or_else(|| bad("negative counter"))?;
                    let left = Self::decode(left)?;
                    let right = Self::decode(right)?;
                    if Self::contains_id(&left) && Self::contains_id(&right) {
                        return Err(bad("two id leaves"));
                    }
                    Ok(Node::Branch {
                        ticks,
                        left: Box::new(left),
                        right: Box::new(right),
                    })
                }
                _ => Err(bad("unrecognised clock form")),
            },
            _ => Err(bad("unrecognised clock form")),
        }
    }
}

impl fmt::Display for TreeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.process_path(), self.ticks())
    }
}

impl Serialize for TreeClock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TreeClock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        TreeClock::from_json(&value).map_err(serde::de::Error::custom)
    }
}
