mod def;

pub use def::{GraphDef, InitializerDef, NodeDef};

use crate::{ElementType, EngineError, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

/// Default operator domain. `ai.onnx` is normalized to the empty string.
pub const ONNX_DOMAIN: &str = "";
/// Contributed operator domain
pub const MS_DOMAIN: &str = "com.microsoft";

/// Opset used for the default domain when a graph declares none
pub const DEFAULT_OPSET: i64 = 17;

pub(crate) fn normalize_domain(domain: &str) -> String {
    if domain == "ai.onnx" {
        ONNX_DOMAIN.to_string()
    } else {
        domain.to_string()
    }
}

/// Node attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    String(String),
}

/// Dimension of a declared shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(usize),
    /// Symbolic dimension resolved at run time
    Dynamic(String),
}

/// Declared type and shape of a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub element_type: ElementType,
    #[serde(default)]
    pub shape: Vec<Dim>,
}

impl ValueInfo {
    pub fn new(name: impl Into<String>, element_type: ElementType, shape: Vec<Dim>) -> Self {
        ValueInfo {
            name: name.into(),
            element_type,
            shape,
        }
    }

    /// Shape with only fixed dimensions, `None` if any dimension is symbolic
    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.shape
            .iter()
            .map(|d| match d {
                Dim::Fixed(n) => Some(*n),
                Dim::Dynamic(_) => None,
            })
            .collect()
    }

    /// Whether a concrete shape satisfies the declared one
    pub fn accepts_shape(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self.shape.iter().zip(shape).all(|(d, &n)| match d {
                Dim::Fixed(f) => *f == n,
                Dim::Dynamic(_) => true,
            })
    }
}

/// Convenience to declare a fully static shape
pub fn fixed(dims: &[usize]) -> Vec<Dim> {
    dims.iter().map(|&d| Dim::Fixed(d)).collect()
}

/// Operator invocation in the graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    /// Opset version, resolved from the graph's opset imports when 0
    pub version: i64,
    /// Ordered inputs, `None` for an omitted optional input
    pub inputs: Vec<Option<String>>,
    pub outputs: Vec<String>,
    pub attributes: HashMap<String, Attribute>,
}

impl Node {
    pub fn new(op_type: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Node {
            name: String::new(),
            op_type: op_type.to_string(),
            domain: ONNX_DOMAIN.to_string(),
            version: 0,
            inputs: inputs
                .iter()
                .map(|s| (!s.is_empty()).then(|| s.to_string()))
                .collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = normalize_domain(domain);
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn with_attribute(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn input(&self, index: usize) -> Option<&str> {
        self.inputs.get(index).and_then(|i| i.as_deref())
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_float(&self, name: &str) -> Option<f32> {
        match self.attributes.get(name) {
            Some(Attribute::Float(v)) => Some(*v),
            Some(Attribute::Int(v)) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn attr_string(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name) {
            Some(Attribute::String(v)) => Some(v),
            _ => None,
        }
    }
}

/// Validated, topologically ordered computation graph
///
/// Read-only once built. Element types are known for every value: declared
/// ones come from value infos, inputs and initializers; the rest are
/// inferred from the producing node.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    inputs: Vec<ValueInfo>,
    outputs: Vec<String>,
    value_infos: HashMap<String, ValueInfo>,
    initializers: BTreeMap<String, Tensor>,
    opset_imports: HashMap<String, i64>,
    value_types: HashMap<String, ElementType>,
    producers: HashMap<String, usize>,
}

impl Graph {
    pub fn builder(name: &str) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    /// Load a graph from its JSON description
    pub fn from_json(json: &str) -> Result<Graph> {
        let def: GraphDef = serde_json::from_str(json)
            .map_err(|e| EngineError::invalid_graph(format!("graph JSON: {}", e)))?;
        def.into_graph()
    }

    /// Load a graph from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Graph> {
        let json = std::fs::read_to_string(path)?;
        Graph::from_json(&json)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in topological order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[ValueInfo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn initializers(&self) -> &BTreeMap<String, Tensor> {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i.name == name)
    }

    pub fn opset(&self, domain: &str) -> Option<i64> {
        self.opset_imports.get(domain).copied()
    }

    /// Declared type and shape of a value, if any
    pub fn value_info(&self, name: &str) -> Option<&ValueInfo> {
        self.value_infos.get(name)
    }

    pub fn value_type(&self, name: &str) -> Option<ElementType> {
        self.value_types.get(name).copied()
    }

    /// Element types of a node's inputs, `None` for omitted inputs
    pub fn input_types(&self, node: &Node) -> Vec<Option<ElementType>> {
        node.inputs
            .iter()
            .map(|i| i.as_deref().and_then(|name| self.value_type(name)))
            .collect()
    }

    /// Index of the node producing `value`
    pub fn producer(&self, value: &str) -> Option<usize> {
        self.producers.get(value).copied()
    }

    /// Indices of the nodes consuming `value`, in topological order
    pub fn consumers(&self, value: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i.as_deref() == Some(value)))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Incremental graph construction, validated by [`GraphBuilder::build`]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    inputs: Vec<ValueInfo>,
    outputs: Vec<String>,
    value_infos: Vec<ValueInfo>,
    initializers: Vec<(String, Tensor)>,
    opset_imports: HashMap<String, i64>,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        GraphBuilder {
            name: name.to_string(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            value_infos: Vec::new(),
            initializers: Vec::new(),
            opset_imports: HashMap::new(),
        }
    }

    pub fn opset(mut self, domain: &str, version: i64) -> Self {
        self.opset_imports.insert(normalize_domain(domain), version);
        self
    }

    pub fn input(mut self, name: &str, element_type: ElementType, shape: Vec<Dim>) -> Self {
        self.inputs.push(ValueInfo::new(name, element_type, shape));
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    pub fn value_info(mut self, name: &str, element_type: ElementType, shape: Vec<Dim>) -> Self {
        self.value_infos.push(ValueInfo::new(name, element_type, shape));
        self
    }

    pub fn initializer(mut self, name: &str, tensor: Tensor) -> Self {
        self.initializers.push((name.to_string(), tensor));
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Validate and order the graph
    ///
    /// # Errors
    /// Returns `InvalidGraph` when a value has more than one producer, a node
    /// reads an undefined value, an output is never produced, the graph has a
    /// cycle, or a node's domain has no opset import.
    pub fn build(self) -> Result<Graph> {
        let GraphBuilder {
            name,
            nodes,
            inputs,
            outputs,
            value_infos,
            initializers,
            mut opset_imports,
        } = self;

        opset_imports
            .entry(ONNX_DOMAIN.to_string())
            .or_insert(DEFAULT_OPSET);
        opset_imports.entry(MS_DOMAIN.to_string()).or_insert(1);

        // every value has exactly one definition
        let mut defined: HashSet<String> = HashSet::new();
        for info in &inputs {
            if !defined.insert(info.name.clone()) {
                return Err(EngineError::invalid_graph(format!(
                    "value {} is defined more than once",
                    info.name
                )));
            }
        }
        let mut initializer_map = BTreeMap::new();
        for (init_name, tensor) in initializers {
            if !defined.insert(init_name.clone()) {
                return Err(EngineError::invalid_graph(format!(
                    "value {} is defined more than once",
                    init_name
                )));
            }
            initializer_map.insert(init_name, tensor);
        }

        let mut nodes: Vec<Node> = nodes;
        for (index, node) in nodes.iter_mut().enumerate() {
            node.domain = normalize_domain(&node.domain);
            if node.name.is_empty() {
                node.name = format!("{}_{}", node.op_type, index);
            }
            if node.version == 0 {
                node.version = *opset_imports.get(&node.domain).ok_or_else(|| {
                    EngineError::invalid_graph(format!(
                        "node {} uses domain {} without an opset import",
                        node.name, node.domain
                    ))
                })?;
            }
            for output in &node.outputs {
                if !defined.insert(output.clone()) {
                    return Err(EngineError::invalid_graph(format!(
                        "value {} has more than one producer",
                        output
                    )));
                }
            }
        }

        for node in &nodes {
            for input in node.inputs.iter().flatten() {
                if !defined.contains(input) {
                    return Err(EngineError::invalid_graph(format!(
                        "node {} reads undefined value {}",
                        node.name, input
                    )));
                }
            }
        }
        for output in &outputs {
            if !defined.contains(output) {
                return Err(EngineError::invalid_graph(format!(
                    "graph output {} is never produced",
                    output
                )));
            }
        }

        let nodes = topological_order(nodes)?;

        let mut producers = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            for output in &node.outputs {
                producers.insert(output.clone(), index);
            }
        }

        let mut infos: HashMap<String, ValueInfo> = HashMap::new();
        for info in inputs.iter().chain(value_infos.iter()) {
            infos.insert(info.name.clone(), info.clone());
        }
        for (init_name, tensor) in &initializer_map {
            infos.entry(init_name.clone()).or_insert_with(|| {
                ValueInfo::new(
                    init_name.clone(),
                    tensor.element_type(),
                    fixed(tensor.shape()),
                )
            });
        }

        let value_types = infer_element_types(&nodes, &infos);

        Ok(Graph {
            name,
            nodes,
            inputs,
            outputs,
            value_infos: infos,
            initializers: initializer_map,
            opset_imports,
            value_types,
            producers,
        })
    }
}

/// Kahn's algorithm, stable with respect to insertion order
fn topological_order(nodes: Vec<Node>) -> Result<Vec<Node>> {
    let mut producer_of: HashMap<&str, usize> = HashMap::new();
    for (index, node) in nodes.iter().enumerate() {
        for output in &node.outputs {
            producer_of.insert(output.as_str(), index);
        }
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        let mut seen = HashSet::new();
        for input in node.inputs.iter().flatten() {
            if let Some(&p) = producer_of.get(input.as_str()) {
                if seen.insert(p) {
                    in_degree[index] += 1;
                    dependents[p].push(index);
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &d in &dependents[index] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(EngineError::invalid_graph("graph contains a cycle"));
    }

    let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

/// Fill in element types for values without a declaration
fn infer_element_types(
    nodes: &[Node],
    infos: &HashMap<String, ValueInfo>,
) -> HashMap<String, ElementType> {
    let mut types: HashMap<String, ElementType> = infos
        .iter()
        .map(|(name, info)| (name.clone(), info.element_type))
        .collect();

    for node in nodes {
        let first_input = node
            .inputs
            .iter()
            .flatten()
            .next()
            .and_then(|i| types.get(i).copied());
        let produced = match node.op_type.as_str() {
            "NonMaxSuppression" | "Shape" => Some(ElementType::Int64),
            "Cast" => node
                .attr_string("to")
                .and_then(ElementType::from_name)
                .or(first_input),
            _ => first_input,
        };
        if let Some(ty) = produced {
            for output in &node.outputs {
                types.entry(output.clone()).or_insert(ty);
            }
        }
    }

    types
}
