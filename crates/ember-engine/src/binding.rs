use crate::{ElementType, EngineError, Location, Result, Tensor};
use std::collections::{BTreeMap, HashMap};

/// Identity of a bound tensor, two binds with the same key are one bind
#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingKey {
    buffer_id: u64,
    location: Location,
    element_type: ElementType,
    shape: Vec<usize>,
}

impl BindingKey {
    fn of(tensor: &Tensor) -> Option<BindingKey> {
        Some(BindingKey {
            buffer_id: tensor.buffer_id()?,
            location: tensor.location(),
            element_type: tensor.element_type(),
            shape: tensor.shape().to_vec(),
        })
    }
}

#[derive(Debug)]
pub(crate) enum OutputBinding {
    /// Caller tensor the output is written into, handed back after the run
    Tensor(Tensor),
    /// Output delivered freshly allocated at this location
    Location(Location),
    /// Output delivered at its configured preferred location
    Preferred,
}

/// Tensors and locations bound to a session ahead of `run_bound`
#[derive(Debug, Default)]
pub(crate) struct IoBinding {
    inputs: BTreeMap<String, Tensor>,
    input_keys: HashMap<String, BindingKey>,
    outputs: BTreeMap<String, OutputBinding>,
    output_keys: HashMap<String, BindingKey>,
    native_bind_calls: usize,
}

impl IoBinding {
    /// Bind `tensor` to input `name`
    ///
    /// Binding the same buffer at the same location again hits the cache:
    /// `validate` is skipped and no bind call is counted.
    pub fn bind_input(
        &mut self,
        name: &str,
        tensor: Tensor,
        validate: impl FnOnce(&Tensor) -> Result<()>,
    ) -> Result<()> {
        let key = BindingKey::of(&tensor);
        if key.is_some() && self.input_keys.get(name) == key.as_ref() {
            log::debug!("input {} already bound to this buffer", name);
            self.inputs.insert(name.to_string(), tensor);
            return Ok(());
        }
        validate(&tensor)?;
        self.native_bind_calls += 1;
        match key {
            Some(key) => self.input_keys.insert(name.to_string(), key),
            None => self.input_keys.remove(name),
        };
        self.inputs.insert(name.to_string(), tensor);
        Ok(())
    }

    /// Bind a caller tensor the output `name` is written into
    ///
    /// The tensor moves into the binding and comes back from the next run.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when other handles share the tensor's buffer
    pub fn bind_output(
        &mut self,
        name: &str,
        tensor: Tensor,
        validate: impl FnOnce(&Tensor) -> Result<()>,
    ) -> Result<()> {
        if !tensor.is_unique() {
            return Err(EngineError::invalid_argument(format!(
                "tensor bound to output {} is shared, the binding must own it",
                name
            )));
        }
        let key = BindingKey::of(&tensor);
        if key.is_some() && self.output_keys.get(name) == key.as_ref() {
            log::debug!("output {} already bound to this buffer", name);
            self.outputs
                .insert(name.to_string(), OutputBinding::Tensor(tensor));
            return Ok(());
        }
        validate(&tensor)?;
        self.native_bind_calls += 1;
        match key {
            Some(key) => self.output_keys.insert(name.to_string(), key),
            None => self.output_keys.remove(name),
        };
        self.outputs
            .insert(name.to_string(), OutputBinding::Tensor(tensor));
        Ok(())
    }

    pub fn bind_output_to_location(&mut self, name: &str, location: Location) {
        if let Some(OutputBinding::Location(bound)) = self.outputs.get(name) {
            if *bound == location {
                return;
            }
        }
        self.native_bind_calls += 1;
        self.output_keys.remove(name);
        self.outputs
            .insert(name.to_string(), OutputBinding::Location(location));
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
        self.input_keys.clear();
        self.outputs.clear();
        self.output_keys.clear();
    }

    pub fn native_bind_calls(&self) -> usize {
        self.native_bind_calls
    }

    /// Inputs and outputs for one run
    ///
    /// Inputs stay bound. Bound output tensors are taken, and their outputs
    /// fall back to the session's configured location for later runs.
    pub fn take_for_run(&mut self) -> (Vec<(String, Tensor)>, Vec<(String, OutputBinding)>) {
        let inputs = self
            .inputs
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect();
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for (name, binding) in self.outputs.iter_mut() {
            let taken = match binding {
                OutputBinding::Location(location) => OutputBinding::Location(*location),
                OutputBinding::Preferred => OutputBinding::Preferred,
                OutputBinding::Tensor(_) => std::mem::replace(binding, OutputBinding::Preferred),
            };
            outputs.push((name.clone(), taken));
        }
        (inputs, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(_: &Tensor) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_rebinding_same_buffer_is_cached() {
        let mut binding = IoBinding::default();
        let tensor = Tensor::from_slice(&[3], &[1.0f32, 2.0, 3.0]).unwrap();

        binding.bind_input("x", tensor.clone(), accept).unwrap();
        binding
            .bind_input("x", tensor.clone(), |_| panic!("cached bind must not revalidate"))
            .unwrap();
        assert_eq!(binding.native_bind_calls(), 1);

        let other = Tensor::from_slice(&[3], &[1.0f32, 2.0, 3.0]).unwrap();
        binding.bind_input("x", other, accept).unwrap();
        assert_eq!(binding.native_bind_calls(), 2);
    }

    #[test]
    fn test_failed_validation_leaves_binding_untouched() {
        let mut binding = IoBinding::default();
        let tensor = Tensor::from_slice(&[1], &[1i64]).unwrap();
        let result = binding.bind_input("x", tensor, |_| {
            Err(EngineError::invalid_argument("wrong type"))
        });
        assert!(result.is_err());
        assert!(binding.take_for_run().0.is_empty());
        assert_eq!(binding.native_bind_calls(), 0);
    }

    #[test]
    fn test_shared_output_tensor_is_rejected() {
        let mut binding = IoBinding::default();
        let tensor = Tensor::from_slice(&[2], &[0.0f32, 0.0]).unwrap();
        let _alias = tensor.clone();
        let err = binding.bind_output("y", tensor, accept).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_output_tensor_is_single_use() {
        let mut binding = IoBinding::default();
        let tensor = Tensor::from_slice(&[2], &[0.0f32, 0.0]).unwrap();
        binding.bind_output("y", tensor, accept).unwrap();

        let (_, outputs) = binding.take_for_run();
        assert!(matches!(outputs[0].1, OutputBinding::Tensor(_)));

        let (_, outputs) = binding.take_for_run();
        assert!(matches!(outputs[0].1, OutputBinding::Preferred));
    }

    #[test]
    fn test_location_binding_is_idempotent() {
        let mut binding = IoBinding::default();
        binding.bind_output_to_location("y", Location::Device(0));
        binding.bind_output_to_location("y", Location::Device(0));
        assert_eq!(binding.native_bind_calls(), 1);
        binding.clear();
        let (inputs, outputs) = binding.take_for_run();
        assert!(inputs.is_empty() && outputs.is_empty());
    }
}
