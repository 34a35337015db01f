use ember_engine::{
    Allocator, CpuProvider, ElementType, ErrorCode, Graph, KernelRegistry, Location, Node,
    ProviderRegistry, Session, Tensor, fixed,
};
use ember_kernels::{default_providers, register_cpu_kernels};
use std::sync::Arc;

// --- Helpers ---

fn cpu_providers() -> ProviderRegistry {
    let mut kernels = KernelRegistry::new();
    register_cpu_kernels(&mut kernels).unwrap();
    let mut providers = ProviderRegistry::new();
    providers
        .register(Arc::new(CpuProvider::new(Arc::new(kernels))))
        .unwrap();
    providers
}

fn matmul_graph() -> Graph {
    Graph::builder("matmul")
        .input("X", ElementType::Float32, fixed(&[2, 2]))
        .input("W", ElementType::Float32, fixed(&[2, 2]))
        .value_info("Y", ElementType::Float32, fixed(&[2, 2]))
        .node(Node::new("MatMul", &["X", "W"], &["Y"]))
        .output("Y")
        .build()
        .unwrap()
}

fn identity_weights() -> Tensor {
    Tensor::from_slice(&[2, 2], &[1.0f32, 0.0, 0.0, 1.0]).unwrap()
}

// --- Input binding ---

#[test]
fn test_rebinding_same_input_is_cached() {
    let providers = cpu_providers();
    let session = Session::builder(&providers).commit(matmul_graph()).unwrap();
    let x = Tensor::from_slice(&[2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();

    session.bind_input("X", x.clone()).unwrap();
    session.bind_input("X", x.clone()).unwrap();
    assert_eq!(session.native_bind_calls(), 1);

    session.bind_input("W", identity_weights()).unwrap();
    assert_eq!(session.native_bind_calls(), 2);

    let outputs = session.run_bound().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].0, "Y");
    assert_eq!(outputs[0].1.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    // inputs stay bound across runs
    let again = session.run_bound().unwrap();
    assert_eq!(again[0].1.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_bind_input_rejects_wrong_tensor() {
    let providers = cpu_providers();
    let session = Session::builder(&providers).commit(matmul_graph()).unwrap();

    let wrong_shape = Tensor::from_slice(&[4], &[1.0f32; 4]).unwrap();
    let err = session.bind_input("X", wrong_shape).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let err = session.bind_input("Q", identity_weights()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(session.native_bind_calls(), 0);
}

#[test]
fn test_run_bound_with_missing_input_fails() {
    let providers = cpu_providers();
    let session = Session::builder(&providers).commit(matmul_graph()).unwrap();
    session.bind_input("X", identity_weights()).unwrap();
    let err = session.run_bound().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

// --- Output binding ---

#[test]
fn test_bound_output_keeps_its_buffer() {
    let providers = default_providers().unwrap();
    let session = Session::builder(&providers)
        .with_output_location("Y", Location::Device(0))
        .commit(matmul_graph())
        .unwrap();
    let x = Tensor::from_slice(&[2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    let y = Tensor::zeros(&Allocator::host(), ElementType::Float32, &[2, 2]).unwrap();
    let id = y.buffer_id();

    session.bind_input("X", x).unwrap();
    session.bind_input("W", identity_weights()).unwrap();
    session.bind_output("Y", y).unwrap();

    let outputs = session.run_bound().unwrap();
    assert_eq!(outputs[0].1.buffer_id(), id);
    assert_eq!(outputs[0].1.location(), Location::Host);
    assert_eq!(outputs[0].1.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    // the tensor went back to the caller, the next run delivers Y where the
    // session was configured to put it
    let next = session.run_bound().unwrap();
    assert_eq!(next[0].0, "Y");
    assert_ne!(next[0].1.buffer_id(), id);
    assert_eq!(next[0].1.location(), Location::Device(0));
    assert_eq!(next[0].1.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_used_output_binding_defaults_to_host() {
    let providers = cpu_providers();
    let session = Session::builder(&providers).commit(matmul_graph()).unwrap();
    let y = Tensor::zeros(&Allocator::host(), ElementType::Float32, &[2, 2]).unwrap();

    session.bind_input("X", identity_weights()).unwrap();
    session.bind_input("W", identity_weights()).unwrap();
    session.bind_output("Y", y).unwrap();
    let returned = session.run_bound().unwrap().remove(0).1;

    // binding the returned tensor again is the same bind
    session.bind_output("Y", returned).unwrap();
    assert_eq!(session.native_bind_calls(), 3);
    session.run_bound().unwrap();

    let next = session.run_bound().unwrap();
    assert_eq!(next[0].1.location(), Location::Host);
}

#[test]
fn test_bind_output_rejects_mismatch_and_shared_tensor() {
    let providers = cpu_providers();
    let session = Session::builder(&providers).commit(matmul_graph()).unwrap();

    let wrong_type = Tensor::zeros(&Allocator::host(), ElementType::Int32, &[2, 2]).unwrap();
    let err = session.bind_output("Y", wrong_type).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let shared = Tensor::zeros(&Allocator::host(), ElementType::Float32, &[2, 2]).unwrap();
    let _keep = shared.clone();
    let err = session.bind_output("Y", shared).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_output_bound_to_device_location() {
    let providers = default_providers().unwrap();
    let session = Session::builder(&providers).commit(matmul_graph()).unwrap();
    session
        .bind_input("X", Tensor::from_slice(&[2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap())
        .unwrap();
    session.bind_input("W", identity_weights()).unwrap();
    session.bind_output_to_location("Y", Location::Device(0)).unwrap();
    session.bind_output_to_location("Y", Location::Device(0)).unwrap();

    let outputs = session.run_bound().unwrap();
    assert_eq!(outputs[0].1.location(), Location::Device(0));
    assert_eq!(outputs[0].1.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let err = session
        .bind_output_to_location("Z", Location::Host)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_clear_bindings() {
    let providers = cpu_providers();
    let session = Session::builder(&providers).commit(matmul_graph()).unwrap();
    session.bind_input("X", identity_weights()).unwrap();
    session.bind_input("W", identity_weights()).unwrap();
    session.clear_bindings().unwrap();

    let err = session.run_bound().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}
