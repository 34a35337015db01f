use super::{Attribute, Graph, GraphBuilder, Node, ValueInfo};
use crate::{ElementType, EngineError, F16, Result, Tensor, TensorElement};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serializable graph description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub opset_imports: HashMap<String, i64>,
    #[serde(default)]
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub value_infos: Vec<ValueInfo>,
    #[serde(default)]
    pub initializers: Vec<InitializerDef>,
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub version: i64,
    /// An empty name marks an omitted optional input
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Attribute>,
}

/// Numeric constant; values are converted to `element_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializerDef {
    pub name: String,
    pub element_type: ElementType,
    #[serde(default)]
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl InitializerDef {
    fn to_tensor(&self) -> Result<Tensor> {
        fn convert<T: TensorElement>(
            def: &InitializerDef,
            f: impl Fn(f64) -> T,
        ) -> Result<Tensor> {
            let values: Vec<T> = def.data.iter().map(|&v| f(v)).collect();
            Tensor::from_slice(&def.shape, &values)
        }

        match self.element_type {
            ElementType::Int8 => convert(self, |v| v as i8),
            ElementType::Int16 => convert(self, |v| v as i16),
            ElementType::Int32 => convert(self, |v| v as i32),
            ElementType::Int64 => convert(self, |v| v as i64),
            ElementType::Uint8 => convert(self, |v| v as u8),
            ElementType::Uint16 => convert(self, |v| v as u16),
            ElementType::Uint32 => convert(self, |v| v as u32),
            ElementType::Uint64 => convert(self, |v| v as u64),
            ElementType::Float16 => convert(self, |v| F16::from_f32(v as f32)),
            ElementType::Float32 => convert(self, |v| v as f32),
            ElementType::Float64 => convert(self, |v| v),
            ElementType::Bool => {
                let flags: Vec<bool> = self.data.iter().map(|&v| v != 0.0).collect();
                Tensor::from_bools(&self.shape, &flags)
            }
            ElementType::String => Err(EngineError::invalid_graph(format!(
                "initializer {} cannot hold strings",
                self.name
            ))),
        }
        .map_err(|e| EngineError::invalid_graph(format!("initializer {}: {}", self.name, e)))
    }
}

impl GraphDef {
    pub fn into_graph(self) -> Result<Graph> {
        let mut builder = GraphBuilder::new(&self.name);
        for (domain, version) in &self.opset_imports {
            builder = builder.opset(domain, *version);
        }
        for info in self.inputs {
            builder = builder.input(&info.name, info.element_type, info.shape);
        }
        for output in &self.outputs {
            builder = builder.output(output);
        }
        for info in self.value_infos {
            builder = builder.value_info(&info.name, info.element_type, info.shape);
        }
        for init in &self.initializers {
            builder = builder.initializer(&init.name, init.to_tensor()?);
        }
        for node in self.nodes {
            let inputs: Vec<&str> = node.inputs.iter().map(|s| s.as_str()).collect();
            let outputs: Vec<&str> = node.outputs.iter().map(|s| s.as_str()).collect();
            let mut built = Node::new(&node.op_type, &inputs, &outputs)
                .with_name(&node.name)
                .with_domain(&node.domain)
                .with_version(node.version);
            built.attributes = node.attributes;
            builder = builder.node(built);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_RELU: &str = r#"{
        "name": "add_relu",
        "opset_imports": { "ai.onnx": 13 },
        "inputs": [{ "name": "A", "element_type": "float32", "shape": [3] }],
        "outputs": ["D"],
        "initializers": [
            { "name": "B", "element_type": "float32", "shape": [3], "data": [1, 1, 1] }
        ],
        "nodes": [
            { "name": "add", "op_type": "Add", "inputs": ["A", "B"], "outputs": ["C"] },
            { "name": "relu", "op_type": "Relu", "inputs": ["C"], "outputs": ["D"],
              "attributes": { "alpha": 0.5, "mode": "fast", "axes": [0, 1] } }
        ]
    }"#;

    #[test]
    fn test_graph_from_json() {
        let graph = Graph::from_json(ADD_RELU).unwrap();
        assert_eq!(graph.name(), "add_relu");
        assert_eq!(graph.nodes().len(), 2);
        assert_eq!(graph.nodes()[0].version, 13);
        assert_eq!(
            graph.initializer("B").unwrap().to_vec::<f32>().unwrap(),
            vec![1.0, 1.0, 1.0]
        );

        let relu = &graph.nodes()[1];
        assert_eq!(relu.attr_float("alpha"), Some(0.5));
        assert_eq!(relu.attr_string("mode"), Some("fast"));
        assert_eq!(
            relu.attributes.get("axes"),
            Some(&Attribute::Ints(vec![0, 1]))
        );
    }

    #[test]
    fn test_optional_input_from_json() {
        let json = r#"{
            "inputs": [
                { "name": "start", "element_type": "int64", "shape": [] },
                { "name": "limit", "element_type": "int64", "shape": [] }
            ],
            "outputs": ["out"],
            "nodes": [{ "op_type": "Range", "inputs": ["start", "limit", ""], "outputs": ["out"] }]
        }"#;
        let graph = Graph::from_json(json).unwrap();
        assert_eq!(graph.nodes()[0].inputs.len(), 3);
        assert_eq!(graph.nodes()[0].input(2), None);
        assert_eq!(graph.nodes()[0].name, "Range_0");
    }

    #[test]
    fn test_bad_json_is_invalid_graph() {
        assert!(matches!(
            Graph::from_json("{ \"nodes\": 3 }"),
            Err(EngineError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_initializer_shape_mismatch() {
        let def = InitializerDef {
            name: "W".into(),
            element_type: ElementType::Int32,
            shape: vec![2, 2],
            data: vec![1.0],
        };
        assert!(matches!(def.to_tensor(), Err(EngineError::InvalidGraph(_))));
    }
}
