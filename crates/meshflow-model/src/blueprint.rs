//! Blueprint wire format, DAG construction and validation.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Identifies one operation invocation within a blueprint: a container
/// paired with one of its declared operations. This is the vertex key
/// of the DAG — a container with several operations contributes one
/// vertex per operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub container_name: String,
    pub operation_name: String,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.container_name, self.operation_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSignature {
    pub operation_name: String,
    #[serde(default)]
    pub input_message_name: String,
    #[serde(default)]
    pub output_message_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub container_name: String,
    pub operation_signature: OperationSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEntry {
    pub operation_signature: OperationSignature,
    #[serde(default)]
    pub connected_to: Vec<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintNode {
    pub container_name: String,
    pub operation_signature_list: Vec<OperationEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub name: String,
    pub pipeline_id: String,
    #[serde(default)]
    pub version: String,
    pub nodes: Vec<BlueprintNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerInfoEntry {
    pub container_name: String,
    pub ip_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerInfo {
    pub docker_info_list: Vec<DockerInfoEntry>,
}

impl DockerInfo {
    pub fn endpoint(&self, container_name: &str) -> Option<String> {
        self.docker_info_list
            .iter()
            .find(|e| e.container_name == container_name)
            .map(|e| format!("http://{}:{}", e.ip_address, e.port))
    }
}

/// The validated, DAG-shaped view of a [`Blueprint`]: one vertex per
/// `NodeKey`, edges pointing from producer to consumer.
pub struct Dag {
    graph: DiGraph<NodeKey, ()>,
    index_of: HashMap<NodeKey, NodeIndex>,
}

impl Dag {
    /// Node keys in the order their tasks should be created, and with
    /// which predecessors each depends on.
    pub fn node_order(&self) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = self.index_of.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn predecessors(&self, key: &NodeKey) -> Vec<NodeKey> {
        let idx = self.index_of[key];
        let mut preds: Vec<NodeKey> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .map(|i| self.graph[i].clone())
            .collect();
        preds.sort();
        preds
    }

    pub fn successors(&self, key: &NodeKey) -> Vec<NodeKey> {
        let idx = self.index_of[key];
        let mut succs: Vec<NodeKey> = self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .map(|i| self.graph[i].clone())
            .collect();
        succs.sort();
        succs
    }

    pub fn is_source(&self, key: &NodeKey) -> bool {
        self.predecessors(key).is_empty()
    }
}

/// Parse and validate a blueprint against the topology rules: every
/// `connected_to` entry must refer to a declared node and operation,
/// the resulting graph must be acyclic, there must be at least one
/// source node, every non-source node must have a producer, and
/// `dockerinfo` must cover every referenced container.
pub fn build_dag(blueprint: &Blueprint, dockerinfo: &DockerInfo) -> Result<Dag> {
    let mut graph = DiGraph::<NodeKey, ()>::new();
    let mut index_of: HashMap<NodeKey, NodeIndex> = HashMap::new();

    for node in &blueprint.nodes {
        for entry in &node.operation_signature_list {
            let key = NodeKey {
                container_name: node.container_name.clone(),
                operation_name: entry.operation_signature.operation_name.clone(),
            };
            let idx = graph.add_node(key.clone());
            index_of.insert(key, idx);
        }
    }

    if index_of.is_empty() {
        return Err(EngineError::invalid_blueprint("blueprint declares no nodes"));
    }

    for node in &blueprint.nodes {
        for entry in &node.operation_signature_list {
            let from_key = NodeKey {
                container_name: node.container_name.clone(),
                operation_name: entry.operation_signature.operation_name.clone(),
            };
            let from_idx = index_of[&from_key];
            for conn in &entry.connected_to {
                let to_key = NodeKey {
                    container_name: conn.container_name.clone(),
                    operation_name: conn.operation_signature.operation_name.clone(),
                };
                let to_idx = index_of.get(&to_key).ok_or_else(|| {
                    EngineError::invalid_blueprint(format!(
                        "{from_key} connects to undeclared node {to_key}"
                    ))
                })?;
                graph.add_edge(from_idx, *to_idx, ());
            }
        }
    }

    if toposort(&graph, None).is_err() {
        return Err(EngineError::invalid_blueprint("blueprint graph contains a cycle"));
    }

    let has_source = index_of.keys().any(|k| {
        let idx = index_of[k];
        graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .next()
            .is_none()
    });
    if !has_source {
        return Err(EngineError::invalid_blueprint(
            "blueprint has no source node (every node has a predecessor)",
        ));
    }

    let containers: HashSet<&str> = blueprint
        .nodes
        .iter()
        .map(|n| n.container_name.as_str())
        .collect();
    let known: HashSet<&str> = dockerinfo
        .docker_info_list
        .iter()
        .map(|e| e.container_name.as_str())
        .collect();
    for c in &containers {
        if !known.contains(c) {
            return Err(EngineError::invalid_blueprint(format!(
                "dockerinfo has no endpoint for container {c}"
            )));
        }
    }

    Ok(Dag { graph, index_of })
}
