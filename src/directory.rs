use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a node within a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopRole {
    Entry,
    Middle,
    Exit,
}

impl HopRole {
    /// Role of hop `index` in a circuit of `hop_count` hops. The last hop is
    /// always the exit.
    pub fn for_position(index: usize, hop_count: usize) -> Self {
        if index + 1 == hop_count {
            HopRole::Exit
        } else if index == 0 {
            HopRole::Entry
        } else {
            HopRole::Middle
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(HopRole::Entry),
            "middle" => Some(HopRole::Middle),
            "exit" => Some(HopRole::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for HopRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HopRole::Entry => "entry",
            HopRole::Middle => "middle",
            HopRole::Exit => "exit",
        })
    }
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("node directory unavailable: {0}")]
    Unavailable(String),
    #[error("invalid node spec: {0}")]
    InvalidSpec(String),
}

/// Source of candidate relay nodes.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn list_eligible_nodes(&self, role: HopRole) -> Result<Vec<NodeId>, DirectoryError>;
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    node: NodeId,
    roles: BTreeSet<HopRole>,
}

const ALL_ROLES: [HopRole; 3] = [HopRole::Entry, HopRole::Middle, HopRole::Exit];

/// Fixed node list, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeDirectory {
    entries: Vec<DirectoryEntry>,
}

impl StaticNodeDirectory {
    /// Every node is eligible for every role.
    pub fn all_roles(nodes: Vec<NodeId>) -> Self {
        let mut directory = Self::default();
        for node in nodes {
            directory.push(node, &ALL_ROLES);
        }
        directory
    }

    /// Parse `name[@role|role...]` entries, e.g. `relay-1,relay-2@exit`.
    pub fn parse(spec: &str) -> Result<Self, DirectoryError> {
        let mut directory = Self::default();
        for raw in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, roles) = match raw.split_once('@') {
                Some((name, roles)) => {
                    let roles = roles
                        .split('|')
                        .map(|r| {
                            HopRole::parse(r.trim())
                                .ok_or_else(|| DirectoryError::InvalidSpec(raw.to_string()))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    (name.trim(), roles)
                }
                None => (raw, ALL_ROLES.to_vec()),
            };
            if name.is_empty() {
                return Err(DirectoryError::InvalidSpec(raw.to_string()));
            }
            directory.push(NodeId::new(name), &roles);
        }
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, node: NodeId, roles: &[HopRole]) {
        let roles: BTreeSet<HopRole> = roles.iter().copied().collect();
        match self.entries.iter_mut().find(|e| e.node == node) {
            Some(existing) => existing.roles.extend(roles),
            None => self.entries.push(DirectoryEntry { node, roles }),
        }
    }
}

#[async_trait]
impl NodeDirectory for StaticNodeDirectory {
    async fn list_eligible_nodes(&self, role: HopRole) -> Result<Vec<NodeId>, DirectoryError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.roles.contains(&role))
            .map(|e| e.node.clone())
            .collect())
    }
}
