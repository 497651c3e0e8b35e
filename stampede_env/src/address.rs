//! Hierarchical addressing for the coordinator / agent / worker / test tree.
//!
//! Every endpoint in a Stampede deployment is identified by a
//! [`SimulatorAddress`]. The hierarchy has a fixed depth of four:
//!
//! ```text
//! C                      coordinator (root)
//! └── A1                 agent 1
//!     ├── A1_W1          worker 1 on agent 1
//!     │   ├── A1_W1_T1   test 1 hosted by that worker
//!     │   └── A1_W1_T2
//!     └── A1_W2
//! ```
//!
//! An index of [`ALL`] (written `*`) is a wildcard: `A*_W*` addresses every
//! worker on every agent, `A2_W*` every worker of agent 2.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Wildcard index matching every sibling at that level.
pub const ALL: u32 = 0;

/// Level of an address in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressLevel {
    /// The single coordinator driving the run
    Coordinator,
    /// A per-host agent process
    Agent,
    /// A worker process supervised by an agent
    Worker,
    /// A test instance hosted by a worker
    Test,
}

impl AddressLevel {
    /// Returns the level one step further from the root, if any.
    pub fn child(&self) -> Option<AddressLevel> {
        match self {
            AddressLevel::Coordinator => Some(AddressLevel::Agent),
            AddressLevel::Agent => Some(AddressLevel::Worker),
            AddressLevel::Worker => Some(AddressLevel::Test),
            AddressLevel::Test => None,
        }
    }

    /// Returns the level one step closer to the root, if any.
    pub fn parent(&self) -> Option<AddressLevel> {
        match self {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => Some(AddressLevel::Coordinator),
            AddressLevel::Worker => Some(AddressLevel::Agent),
            AddressLevel::Test => Some(AddressLevel::Worker),
        }
    }
}

/// Errors produced when parsing the textual address form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    /// Input was empty
    #[error("empty address")]
    Empty,

    /// A token between separators was empty
    #[error("missing level token in '{0}'")]
    MissingLevel(String),

    /// Index was not a positive integer or `*`
    #[error("invalid index '{index}' in '{input}'")]
    InvalidIndex {
        /// Full input string
        input: String,
        /// Offending index text
        index: String,
    },

    /// Token prefix did not match the expected level
    #[error("unexpected token '{token}' at position {position} in '{input}'")]
    UnexpectedToken {
        /// Full input string
        input: String,
        /// Offending token
        token: String,
        /// Zero-based token position
        position: usize,
    },
}

/// Immutable identity of an endpoint (or group of endpoints) in the hierarchy.
///
/// Fields below the address's level are always zero. Ordering is by level,
/// then agent, worker and test index, which keeps routing tables sorted
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SimulatorAddress {
    level: AddressLevel,
    agent_index: u32,
    worker_index: u32,
    test_index: u32,
}

impl SimulatorAddress {
    /// The coordinator address.
    pub const COORDINATOR: SimulatorAddress = SimulatorAddress {
        level: AddressLevel::Coordinator,
        agent_index: 0,
        worker_index: 0,
        test_index: 0,
    };

    /// Returns the coordinator address.
    pub fn coordinator() -> Self {
        Self::COORDINATOR
    }

    /// Address of an agent (`ALL` for every agent).
    pub fn agent(agent_index: u32) -> Self {
        Self {
            level: AddressLevel::Agent,
            agent_index,
            worker_index: 0,
            test_index: 0,
        }
    }

    /// Address of a worker on an agent.
    pub fn worker(agent_index: u32, worker_index: u32) -> Self {
        Self {
            level: AddressLevel::Worker,
            agent_index,
            worker_index,
            test_index: 0,
        }
    }

    /// Address of a test hosted by a worker.
    pub fn test(agent_index: u32, worker_index: u32, test_index: u32) -> Self {
        Self {
            level: AddressLevel::Test,
            agent_index,
            worker_index,
            test_index,
        }
    }

    /// Broadcast address reaching every agent.
    pub fn all_agents() -> Self {
        Self::agent(ALL)
    }

    /// Broadcast address reaching every worker of every agent.
    pub fn all_workers() -> Self {
        Self::worker(ALL, ALL)
    }

    /// Returns the level of this address.
    pub fn level(&self) -> AddressLevel {
        self.level
    }

    /// Returns the agent index (0 for the coordinator or a wildcard).
    pub fn agent_index(&self) -> u32 {
        self.agent_index
    }

    /// Returns the worker index (0 above worker level or for a wildcard).
    pub fn worker_index(&self) -> u32 {
        self.worker_index
    }

    /// Returns the test index (0 above test level or for a wildcard).
    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// True if any index at or above this address's level is a wildcard.
    pub fn is_broadcast(&self) -> bool {
        match self.level {
            AddressLevel::Coordinator => false,
            AddressLevel::Agent => self.agent_index == ALL,
            AddressLevel::Worker => self.agent_index == ALL || self.worker_index == ALL,
            AddressLevel::Test => {
                self.agent_index == ALL || self.worker_index == ALL || self.test_index == ALL
            }
        }
    }

    /// Returns the parent address, or `None` for the coordinator.
    pub fn parent(&self) -> Option<SimulatorAddress> {
        match self.level {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => Some(Self::COORDINATOR),
            AddressLevel::Worker => Some(Self::agent(self.agent_index)),
            AddressLevel::Test => Some(Self::worker(self.agent_index, self.worker_index)),
        }
    }

    /// Returns the child address with the given index, or `None` below test level.
    pub fn child(&self, index: u32) -> Option<SimulatorAddress> {
        match self.level {
            AddressLevel::Coordinator => Some(Self::agent(index)),
            AddressLevel::Agent => Some(Self::worker(self.agent_index, index)),
            AddressLevel::Worker => Some(Self::test(self.agent_index, self.worker_index, index)),
            AddressLevel::Test => None,
        }
    }

    /// Truncates this address to agent level.
    pub fn agent_address(&self) -> Option<SimulatorAddress> {
        match self.level {
            AddressLevel::Coordinator => None,
            _ => Some(Self::agent(self.agent_index)),
        }
    }

    /// Truncates this address to worker level.
    pub fn worker_address(&self) -> Option<SimulatorAddress> {
        match self.level {
            AddressLevel::Worker | AddressLevel::Test => {
                Some(Self::worker(self.agent_index, self.worker_index))
            }
            _ => None,
        }
    }

    /// True if `other` lies strictly below this address in the hierarchy.
    ///
    /// Wildcards in `self` match any index, so `A*` is a parent of every
    /// worker and test address.
    pub fn is_parent_of(&self, other: &SimulatorAddress) -> bool {
        other.level > self.level && self.prefix_matches(other, self.level)
    }

    /// True if this (destination) address reaches `node` or its subtree.
    ///
    /// The destination must be at or below `node`'s level and agree with it
    /// on every index down to `node`'s level.
    pub fn reaches(&self, node: &SimulatorAddress) -> bool {
        self.level >= node.level && self.prefix_matches(node, node.level)
    }

    /// True if this (destination) address designates `local` itself.
    pub fn covers(&self, local: &SimulatorAddress) -> bool {
        self.level == local.level && self.reaches(local)
    }

    /// True if this address contains the test with the given index.
    pub fn contains_test(&self, test_index: u32) -> bool {
        match self.level {
            AddressLevel::Test => index_matches(self.test_index, test_index),
            _ => true,
        }
    }

    fn prefix_matches(&self, other: &SimulatorAddress, depth: AddressLevel) -> bool {
        if depth >= AddressLevel::Agent && !index_matches(self.agent_index, other.agent_index) {
            return false;
        }
        if depth >= AddressLevel::Worker && !index_matches(self.worker_index, other.worker_index) {
            return false;
        }
        if depth >= AddressLevel::Test && !index_matches(self.test_index, other.test_index) {
            return false;
        }
        true
    }
}

fn index_matches(pattern: u32, value: u32) -> bool {
    pattern == ALL || pattern == value
}

struct Index(u32);

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == ALL {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for SimulatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            AddressLevel::Coordinator => write!(f, "C"),
            AddressLevel::Agent => write!(f, "A{}", Index(self.agent_index)),
            AddressLevel::Worker => write!(
                f,
                "A{}_W{}",
                Index(self.agent_index),
                Index(self.worker_index)
            ),
            AddressLevel::Test => write!(
                f,
                "A{}_W{}_T{}",
                Index(self.agent_index),
                Index(self.worker_index),
                Index(self.test_index)
            ),
        }
    }
}

impl FromStr for SimulatorAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }
        if s == "C" {
            return Ok(Self::COORDINATOR);
        }

        const PREFIXES: [char; 3] = ['A', 'W', 'T'];
        let mut indices = [0u32; 3];
        let mut count = 0;

        for (position, token) in s.split('_').enumerate() {
            if token.is_empty() {
                return Err(AddressParseError::MissingLevel(s.to_string()));
            }
            let mut chars = token.chars();
            let prefix = chars.next();
            if position >= PREFIXES.len() || prefix != Some(PREFIXES[position]) {
                return Err(AddressParseError::UnexpectedToken {
                    input: s.to_string(),
                    token: token.to_string(),
                    position,
                });
            }
            indices[position] = parse_index(s, chars.as_str())?;
            count += 1;
        }

        Ok(match count {
            1 => Self::agent(indices[0]),
            2 => Self::worker(indices[0], indices[1]),
            _ => Self::test(indices[0], indices[1], indices[2]),
        })
    }
}

fn parse_index(input: &str, text: &str) -> Result<u32, AddressParseError> {
    if text == "*" {
        return Ok(ALL);
    }
    let invalid = || AddressParseError::InvalidIndex {
        input: input.to_string(),
        index: text.to_string(),
    };
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match text.parse::<u32>() {
        Ok(ALL) | Err(_) => Err(invalid()),
        Ok(index) => Ok(index),
    }
}

impl From<SimulatorAddress> for String {
    fn from(address: SimulatorAddress) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for SimulatorAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_display_forms() {
        assert_eq!(SimulatorAddress::coordinator().to_string(), "C");
        assert_eq!(SimulatorAddress::agent(3).to_string(), "A3");
        assert_eq!(SimulatorAddress::worker(1, 2).to_string(), "A1_W2");
        assert_eq!(SimulatorAddress::test(1, 2, 3).to_string(), "A1_W2_T3");
        assert_eq!(SimulatorAddress::all_workers().to_string(), "A*_W*");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<SimulatorAddress>(), Err(AddressParseError::Empty));
        assert!(matches!(
            "A1_".parse::<SimulatorAddress>(),
            Err(AddressParseError::MissingLevel(_))
        ));
        assert!(matches!(
            "W1".parse::<SimulatorAddress>(),
            Err(AddressParseError::UnexpectedToken { position: 0, .. })
        ));
        assert!(matches!(
            "A1_T2".parse::<SimulatorAddress>(),
            Err(AddressParseError::UnexpectedToken { position: 1, .. })
        ));
        assert!(matches!(
            "A1_W1_T1_T1".parse::<SimulatorAddress>(),
            Err(AddressParseError::UnexpectedToken { position: 3, .. })
        ));
        assert!(matches!(
            "Ax".parse::<SimulatorAddress>(),
            Err(AddressParseError::InvalidIndex { .. })
        ));
        assert!(matches!(
            "A0".parse::<SimulatorAddress>(),
            Err(AddressParseError::InvalidIndex { .. })
        ));
        assert!(matches!(
            "A99999999999".parse::<SimulatorAddress>(),
            Err(AddressParseError::InvalidIndex { .. })
        ));
        assert!(matches!(
            "A-1".parse::<SimulatorAddress>(),
            Err(AddressParseError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn test_parent_child_navigation() {
        let test = SimulatorAddress::test(2, 3, 4);
        let worker = test.parent().unwrap();
        assert_eq!(worker, SimulatorAddress::worker(2, 3));
        assert_eq!(worker.parent(), Some(SimulatorAddress::agent(2)));
        assert_eq!(
            SimulatorAddress::agent(2).parent(),
            Some(SimulatorAddress::coordinator())
        );
        assert_eq!(SimulatorAddress::coordinator().parent(), None);
        assert_eq!(worker.child(4), Some(test));
        assert_eq!(test.child(1), None);
    }

    #[test]
    fn test_broadcast_containment() {
        let agent = SimulatorAddress::agent(1);
        let worker = agent.child(2).unwrap();

        assert!(agent.is_parent_of(&worker));
        assert!(!worker.is_parent_of(&agent));
        assert!(!agent.is_parent_of(&agent));
        assert!(!SimulatorAddress::agent(2).is_parent_of(&worker));
        assert!(SimulatorAddress::all_agents().is_parent_of(&worker));
        assert!(SimulatorAddress::coordinator().is_parent_of(&worker));
    }

    #[test]
    fn test_covers_with_wildcards() {
        let worker = SimulatorAddress::worker(1, 2);
        assert!(SimulatorAddress::all_workers().covers(&worker));
        assert!(SimulatorAddress::worker(1, ALL).covers(&worker));
        assert!(!SimulatorAddress::worker(2, ALL).covers(&worker));
        assert!(!SimulatorAddress::agent(1).covers(&worker));
        assert!(SimulatorAddress::test(1, 2, 5).reaches(&worker));
        assert!(!SimulatorAddress::agent(1).reaches(&worker));
    }

    #[test]
    fn test_contains_test() {
        assert!(SimulatorAddress::test(1, 1, 3).contains_test(3));
        assert!(!SimulatorAddress::test(1, 1, 3).contains_test(4));
        assert!(SimulatorAddress::test(1, 1, ALL).contains_test(4));
        assert!(SimulatorAddress::worker(1, 1).contains_test(9));
    }

    #[test]
    fn test_ordering_by_level_then_index() {
        let mut addresses = vec![
            SimulatorAddress::test(1, 1, 1),
            SimulatorAddress::worker(2, 1),
            SimulatorAddress::agent(3),
            SimulatorAddress::worker(1, 2),
            SimulatorAddress::coordinator(),
        ];
        addresses.sort();
        let rendered: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        assert_eq!(rendered, vec!["C", "A3", "A1_W2", "A2_W1", "A1_W1_T1"]);
    }

    #[test]
    fn test_string_conversions() {
        let text = String::from(SimulatorAddress::worker(4, 7));
        assert_eq!(text, "A4_W7");
        assert_eq!(
            SimulatorAddress::try_from(text).unwrap(),
            SimulatorAddress::worker(4, 7)
        );
        assert!(SimulatorAddress::try_from("A4_X7".to_string()).is_err());
    }

    fn address_strategy() -> impl Strategy<Value = SimulatorAddress> {
        let index = 0u32..500;
        prop_oneof![
            Just(SimulatorAddress::coordinator()),
            index.clone().prop_map(SimulatorAddress::agent),
            (index.clone(), index.clone()).prop_map(|(a, w)| SimulatorAddress::worker(a, w)),
            (index.clone(), index.clone(), index).prop_map(|(a, w, t)| SimulatorAddress::test(a, w, t)),
        ]
    }

    proptest! {
        #[test]
        fn prop_text_round_trip(address in address_strategy()) {
            let text = address.to_string();
            let parsed: SimulatorAddress = text.parse().unwrap();
            prop_assert_eq!(parsed, address);
            prop_assert_eq!(parsed.to_string(), text);
        }

        #[test]
        fn prop_worker_under_agent(agent in 1u32..500, worker in 1u32..500) {
            let a = SimulatorAddress::agent(agent);
            let w = a.child(worker).unwrap();
            prop_assert!(a.is_parent_of(&w));
            prop_assert!(!w.is_parent_of(&a));
        }
    }
}
