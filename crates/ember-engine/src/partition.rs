use crate::graph::Graph;
use crate::provider::ExecutionProvider;
use crate::{EngineError, Location, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Copy of a value into another location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEdge {
    pub value: String,
    pub from: Location,
    pub to: Location,
    /// Nodes reading the copy, empty when it only serves a graph output
    pub consumers: Vec<usize>,
}

/// Where a graph output is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlacement {
    pub name: String,
    pub location: Location,
    /// The producer allocates the output in `location` itself
    pub direct: bool,
    /// Transfer that brings the value to `location`
    pub transfer: Option<usize>,
}

/// Provider assignment of every node plus the transfers it implies
#[derive(Debug, Clone)]
pub struct Partition {
    /// Index into the provider list, per node in topological order
    pub assignments: Vec<usize>,
    pub transfers: Vec<TransferEdge>,
    pub outputs: Vec<OutputPlacement>,
    /// Location every value lives in before any transfer
    pub locations: HashMap<String, Location>,
}

impl Partition {
    /// Transfer feeding `node` with `value`, if one is needed
    pub fn transfer_for(&self, value: &str, node: usize) -> Option<&TransferEdge> {
        self.transfers
            .iter()
            .find(|t| t.value == value && t.consumers.contains(&node))
    }
}

/// Assign nodes to providers and find the cross-location edges
///
/// `providers` is in priority order, highest first. Each node goes to the
/// first provider whose `can_execute` accepts it. Graph outputs default to
/// host memory unless `preferred` names another location.
///
/// # Errors
/// Returns `UnassignableNode` when no provider accepts a node.
pub fn partition(
    graph: &Graph,
    providers: &[Arc<dyn ExecutionProvider>],
    preferred: &HashMap<String, Location>,
) -> Result<Partition> {
    let mut assignments = Vec::with_capacity(graph.nodes().len());
    for node in graph.nodes() {
        let index = providers
            .iter()
            .position(|p| p.can_execute(node, graph))
            .ok_or_else(|| EngineError::UnassignableNode {
                node: node.name.clone(),
                op_type: node.op_type.clone(),
            })?;
        log::debug!(
            "node {} ({}) assigned to {}",
            node.name,
            node.op_type,
            providers[index].name()
        );
        assignments.push(index);
    }

    let mut locations: HashMap<String, Location> = HashMap::new();
    for input in graph.inputs() {
        locations.insert(input.name.clone(), Location::Host);
    }
    for name in graph.initializers().keys() {
        locations.insert(name.clone(), Location::Host);
    }

    // outputs whose producer can allocate them at the wanted location directly
    let mut direct: HashMap<&str, Location> = HashMap::new();
    for output in graph.outputs() {
        let wanted = preferred.get(output).copied().unwrap_or(Location::Host);
        if let Some(producer) = graph.producer(output) {
            let provider = &providers[assignments[producer]];
            if provider.output_locations().contains(&wanted) {
                direct.insert(output.as_str(), wanted);
            }
        }
    }

    for (index, node) in graph.nodes().iter().enumerate() {
        let provider = &providers[assignments[index]];
        for output in &node.outputs {
            let location = direct
                .get(output.as_str())
                .copied()
                .unwrap_or_else(|| provider.default_location());
            locations.insert(output.clone(), location);
        }
    }

    let mut transfers: Vec<TransferEdge> = Vec::new();
    let mut add_transfer = |value: &str, from: Location, to: Location, consumer: Option<usize>| {
        let position = transfers
            .iter()
            .position(|t| t.value == value && t.to == to);
        let index = match position {
            Some(index) => index,
            None => {
                log::debug!("transfer of {} from {} to {}", value, from, to);
                transfers.push(TransferEdge {
                    value: value.to_string(),
                    from,
                    to,
                    consumers: Vec::new(),
                });
                transfers.len() - 1
            }
        };
        if let Some(consumer) = consumer {
            if !transfers[index].consumers.contains(&consumer) {
                transfers[index].consumers.push(consumer);
            }
        }
        index
    };

    for (index, node) in graph.nodes().iter().enumerate() {
        let provider = &providers[assignments[index]];
        let readable = provider.input_locations();
        for input in node.inputs.iter().flatten() {
            let from = locations.get(input).copied().unwrap_or(Location::Host);
            if !readable.contains(&from) {
                add_transfer(input, from, provider.default_location(), Some(index));
            }
        }
    }

    let mut outputs = Vec::with_capacity(graph.outputs().len());
    for output in graph.outputs() {
        let wanted = preferred.get(output).copied().unwrap_or(Location::Host);
        let from = locations.get(output).copied().unwrap_or(Location::Host);
        let transfer = (from != wanted).then(|| add_transfer(output, from, wanted, None));
        outputs.push(OutputPlacement {
            name: output.clone(),
            location: wanted,
            direct: direct.contains_key(output.as_str()),
            transfer,
        });
    }

    Ok(Partition {
        assignments,
        transfers,
        outputs,
        locations,
    })
}
