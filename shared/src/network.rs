use std::collections::BTreeMap;

use crate::error::Error;
use crate::types::{Group, GroupTopology, Node, NodeName};

/// The validated node and group tables. Frozen once constructed; the
/// pipeline only ever reads from it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Network {
    nodes: BTreeMap<NodeName, Node>,
    groups: BTreeMap<String, Group>,
}

impl Network {
    /// Builds the table, enforcing the model invariants: unique names,
    /// host-unique overlay addresses, resolvable group members, and group
    /// arity per topology. All violations are reported, not just the first.
    pub fn new(nodes: Vec<Node>, groups: Vec<Group>) -> Result<Self, Vec<Error>> {
        let mut errors = Vec::new();
        let mut table: BTreeMap<NodeName, Node> = BTreeMap::new();

        for node in nodes {
            if table.contains_key(&node.name) {
                errors.push(Error::DuplicateNodeName {
                    name: node.name.to_string(),
                });
                continue;
            }
            table.insert(node.name.clone(), node);
        }

        // Host-uniqueness is on the address, not the full prefix: two nodes
        // on the same /16 are fine, two nodes at the same address are not.
        let by_addr: Vec<(&NodeName, &Node)> = table.iter().collect();
        for (i, (_, a)) in by_addr.iter().enumerate() {
            for (_, b) in &by_addr[i + 1..] {
                if a.overlay_addr() == b.overlay_addr() {
                    errors.push(Error::DuplicateNodeIp {
                        names: vec![a.name.to_string(), b.name.to_string()],
                        ip: a.overlay_addr(),
                    });
                }
            }
        }

        let mut group_table: BTreeMap<String, Group> = BTreeMap::new();
        for group in groups {
            for member in &group.members {
                if !table.contains_key(member) {
                    errors.push(Error::UnknownReference {
                        name: member.to_string(),
                        context: format!("group {:?}", group.name),
                    });
                }
            }
            if let Some(arity) = check_arity(&group) {
                errors.push(arity);
            }
            group_table.insert(group.name.clone(), group);
        }

        if errors.is_empty() {
            Ok(Self {
                nodes: table,
                groups: group_table,
            })
        } else {
            Err(errors)
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        let key: NodeName = name.parse().ok()?;
        self.nodes.get(&key)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// All nodes, alphabetically.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves a connection side: a group name yields its members sorted
    /// alphabetically, a node name yields a singleton.
    pub fn side_members(&self, name: &str) -> Option<Vec<&Node>> {
        if let Some(group) = self.groups.get(name) {
            let mut members: Vec<&Node> = group
                .members
                .iter()
                .filter_map(|m| self.nodes.get(m))
                .collect();
            members.sort_by(|a, b| a.name.cmp(&b.name));
            return Some(members);
        }
        self.node(name).map(|n| vec![n])
    }

    /// True when `name` is a group containing `node`, or `name` is the node
    /// itself. Used to match routing-rule subjects.
    pub fn subject_covers(&self, name: &str, node: &NodeName) -> bool {
        if name == node.as_str() {
            return true;
        }
        self.groups
            .get(name)
            .map(|g| g.members.contains(node))
            .unwrap_or(false)
    }
}

fn check_arity(group: &Group) -> Option<Error> {
    let n = group.members.len();
    let fail = |reason: String| {
        Some(Error::TopologyArity {
            group: group.name.clone(),
            reason,
        })
    };
    match group.topology {
        GroupTopology::Mesh if n < 2 => fail(format!("mesh needs at least 2 members, has {n}")),
        GroupTopology::Chain if n < 2 => fail(format!("chain needs at least 2 members, has {n}")),
        GroupTopology::Single if n != 1 => {
            fail(format!("single needs exactly 1 member, has {n}"))
        },
        GroupTopology::Star => match &group.hub {
            None => fail("star needs a hub".to_string()),
            Some(hub) if !group.members.contains(hub) => {
                fail(format!("hub {hub:?} is not a member"))
            },
            _ if n < 2 => fail(format!("star needs at least 2 members, has {n}")),
            _ => None,
        },
        _ => None,
    }
}
