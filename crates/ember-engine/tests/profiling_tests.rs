use ember_engine::{ElementType, ErrorCode, Graph, Node, Session, Tensor, fixed};
use ember_kernels::default_providers;
use std::fs;

fn add_relu_graph() -> Graph {
    Graph::builder("add_relu")
        .input("A", ElementType::Float32, fixed(&[3]))
        .input("B", ElementType::Float32, fixed(&[3]))
        .node(Node::new("Add", &["A", "B"], &["C"]).with_name("add"))
        .node(Node::new("Relu", &["C"], &["D"]).with_name("relu"))
        .output("D")
        .build()
        .unwrap()
}

#[test]
fn test_profile_is_written_once() {
    let dir = std::env::temp_dir().join(format!("ember-profile-test-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);

    let providers = default_providers().unwrap();
    let session = Session::builder(&providers)
        .with_profiling(&dir)
        .commit(add_relu_graph())
        .unwrap();
    let a = Tensor::from_slice(&[3], &[1.0f32, -2.0, 3.0]).unwrap();
    for _ in 0..2 {
        session.run(&[("A", &a), ("B", &a)], &["D"]).unwrap();
    }

    let events = session.profile_events();
    let steps = session.plan().steps.len();
    assert_eq!(events.len(), 2 * steps);
    assert!(events.iter().any(|e| e.name == "add" && e.provider == "gpu"));
    assert_eq!(events.last().unwrap().run, 2);

    let path = session.end_profiling().unwrap();
    let file_name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("ember_profile_"));
    assert!(file_name.ends_with(&format!("_{}.json", session.id())));

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written.as_array().unwrap().len(), 2 * steps);
    assert_eq!(written[0]["run"], 1);

    // profiling stops once the file is written
    let err = session.end_profiling().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Configuration);
    session.run(&[("A", &a), ("B", &a)], &["D"]).unwrap();
    assert!(session.profile_events().is_empty());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_end_profiling_without_profiling_fails() {
    let providers = default_providers().unwrap();
    let session = Session::builder(&providers).commit(add_relu_graph()).unwrap();
    let a = Tensor::from_slice(&[3], &[1.0f32, 2.0, 3.0]).unwrap();
    session.run(&[("A", &a), ("B", &a)], &[]).unwrap();

    assert!(session.profile_events().is_empty());
    let err = session.end_profiling().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Configuration);
}
