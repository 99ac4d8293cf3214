//! Reading the transformation graph from a dbt `manifest.json`.
//!
//! Only model nodes become tasks. Edges to sources, seeds and tests are
//! dropped: sources are what the ingestion stage fills, and the stage
//! barrier already orders ingestion before every model.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Deserialize;

use crate::core::task::TaskAction;
use crate::orchestration::actions::CommandAction;
use crate::{flog, Error, Result};

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    nodes: BTreeMap<String, RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    resource_type: String,
    name: String,
    #[serde(default)]
    depends_on: RawDependsOn,
}

#[derive(Debug, Default, Deserialize)]
struct RawDependsOn {
    #[serde(default)]
    nodes: Vec<String>,
}

/// A model and the names of the models it reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelNode {
    pub unique_id: String,
    pub name: String,
    pub depends_on: Vec<String>,
}

/// Parse manifest JSON into models, upstream models before downstream.
///
/// Kahn's algorithm over a petgraph graph of the model nodes, with a
/// min-heap on `unique_id` order, so the result is stable for a given
/// manifest.
///
/// # Errors
/// `Manifest` if two models share a name or the model graph has a cycle.
pub fn parse_models(json: &str) -> Result<Vec<ModelNode>> {
    let raw: RawManifest = serde_json::from_str(json)?;

    // BTreeMap iteration order makes node indices follow unique_id order.
    let mut graph: DiGraph<ModelNode, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    let mut names: HashMap<&str, &str> = HashMap::new();
    for (id, node) in raw.nodes.iter().filter(|(_, n)| n.resource_type == "model") {
        if let Some(other) = names.insert(node.name.as_str(), id.as_str()) {
            return Err(Error::Manifest(format!(
                "model name {} is used by both {} and {}",
                node.name, other, id
            )));
        }
        let idx = graph.add_node(ModelNode {
            unique_id: id.clone(),
            name: node.name.clone(),
            depends_on: Vec::new(),
        });
        index.insert(id.as_str(), idx);
    }

    for (id, node) in &raw.nodes {
        let Some(&downstream) = index.get(id.as_str()) else {
            continue;
        };
        let mut depends_on: Vec<String> = Vec::new();
        for dep in &node.depends_on.nodes {
            if let Some(&upstream) = index.get(dep.as_str()) {
                graph.update_edge(upstream, downstream, ());
                depends_on.push(graph[upstream].name.clone());
            }
        }
        depends_on.sort();
        depends_on.dedup();
        graph[downstream].depends_on = depends_on;
    }

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|i| in_degree[i.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order: Vec<NodeIndex> = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < graph.node_count() {
        let mut stuck: Vec<&str> = graph
            .node_indices()
            .filter(|i| in_degree[i.index()] > 0)
            .map(|i| graph[i].name.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(Error::Manifest(format!(
            "model dependencies form a cycle among: {}",
            stuck.join(", ")
        )));
    }

    Ok(order.into_iter().map(|i| graph[i].clone()).collect())
}

/// Read and parse a manifest file.
pub fn load_models(path: &Path) -> Result<Vec<ModelNode>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| Error::Manifest(format!("cannot read {}: {}", path.display(), e)))?;
    let models = parse_models(&json)?;
    flog!("Loaded {} models from {}", models.len(), path.display());
    Ok(models)
}

/// Generate the manifest with `prepare` if it does not exist yet.
pub fn ensure_manifest(path: &Path, prepare: Option<&CommandAction>) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let Some(prepare) = prepare else {
        return Err(Error::Manifest(format!(
            "{} not found and no prepare command configured",
            path.display()
        )));
    };

    flog!("Manifest {} missing, running: {}", path.display(), prepare.describe());
    let output = prepare.invoke();
    if !output.is_success() {
        return Err(Error::Manifest(format!(
            "prepare command exited with {}: {}",
            output.exit_code, output.stderr
        )));
    }
    if !path.exists() {
        return Err(Error::Manifest(format!(
            "prepare command succeeded but {} was not written",
            path.display()
        )));
    }
    Ok(())
}
