use ember_engine::{
    CPU_PROVIDER, CpuProvider, ElementType, EngineError, ErrorCode, Graph, Kernel, KernelContext,
    KernelDef, KernelRegistry, Node, ProviderRegistry, Result, RunPhase, Session, Tensor, fixed,
};
use ember_kernels::{default_providers, register_cpu_kernels};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

// --- Helpers ---

/// Signals when a run reaches it, then holds the run until released
struct Gate {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

struct Block(Arc<Gate>);

impl Kernel for Block {
    fn compute(&self, ctx: &mut KernelContext) -> Result<()> {
        let x = ctx.required_input(0)?.clone();
        let _ = self.0.entered.lock().unwrap().send(());
        let _ = self.0.release.lock().unwrap().recv();
        ctx.set_output(0, x)
    }
}

fn gated_session(gate: Arc<Gate>) -> (ProviderRegistry, Graph) {
    let mut kernels = KernelRegistry::new();
    register_cpu_kernels(&mut kernels).unwrap();
    kernels
        .register(KernelDef::new("Block", CPU_PROVIDER, move |_| {
            Ok(Box::new(Block(Arc::clone(&gate))) as Box<dyn Kernel>)
        }))
        .unwrap();
    let mut providers = ProviderRegistry::new();
    providers
        .register(Arc::new(CpuProvider::new(Arc::new(kernels))))
        .unwrap();

    let graph = Graph::builder("gated")
        .input("X", ElementType::Float32, fixed(&[2]))
        .node(Node::new("Block", &["X"], &["Y"]))
        .output("Y")
        .build()
        .unwrap();
    (providers, graph)
}

fn add_graph() -> Graph {
    Graph::builder("add")
        .input("A", ElementType::Float32, fixed(&[2]))
        .input("B", ElementType::Float32, fixed(&[2]))
        .node(Node::new("Add", &["A", "B"], &["C"]))
        .output("C")
        .build()
        .unwrap()
}

// --- Run exclusion ---

#[test]
fn test_second_run_while_busy_fails() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = Arc::new(Gate {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let (providers, graph) = gated_session(gate);
    let session = Session::builder(&providers).commit(graph).unwrap();
    let x = Tensor::from_slice(&[2], &[1.0f32, 2.0]).unwrap();

    thread::scope(|scope| {
        let first = scope.spawn(|| session.run(&[("X", &x)], &["Y"]));

        entered_rx.recv().unwrap();
        assert_eq!(session.phase(), RunPhase::Running);
        let err = session.run(&[("X", &x)], &["Y"]).unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy));
        assert_eq!(err.code(), ErrorCode::SessionBusy);

        // bindings can't change under a run either
        let err = session.bind_input("X", x.clone()).unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy));
        let err = session.clear_bindings().unwrap_err();
        assert!(matches!(err, EngineError::SessionBusy));
        assert_eq!(session.native_bind_calls(), 0);

        release_tx.send(()).unwrap();
        let outputs = first.join().unwrap().unwrap();
        assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    });

    // usable again once the first run is done
    assert_eq!(session.phase(), RunPhase::Idle);
    release_tx.send(()).unwrap();
    let outputs = session.run(&[("X", &x)], &["Y"]).unwrap();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    entered_rx.try_recv().unwrap();
    session.bind_input("X", x.clone()).unwrap();
    assert_eq!(session.native_bind_calls(), 1);
}

#[test]
fn test_sessions_run_concurrently() {
    let providers = default_providers().unwrap();
    let first = Session::builder(&providers).commit(add_graph()).unwrap();
    let second = Session::builder(&providers).commit(add_graph()).unwrap();
    assert_ne!(first.id(), second.id());

    thread::scope(|scope| {
        let a = scope.spawn(|| {
            let x = Tensor::from_slice(&[2], &[1.0f32, 2.0]).unwrap();
            for _ in 0..20 {
                let c = first.run(&[("A", &x), ("B", &x)], &[]).unwrap();
                assert_eq!(c[0].to_vec::<f32>().unwrap(), vec![2.0, 4.0]);
            }
        });
        let b = scope.spawn(|| {
            let x = Tensor::from_slice(&[2], &[-1.0f32, 5.0]).unwrap();
            let y = Tensor::from_slice(&[2], &[1.0f32, 5.0]).unwrap();
            for _ in 0..20 {
                let c = second.run(&[("A", &x), ("B", &y)], &[]).unwrap();
                assert_eq!(c[0].to_vec::<f32>().unwrap(), vec![0.0, 10.0]);
            }
        });
        a.join().unwrap();
        b.join().unwrap();
    });
}

// --- Async ---

#[tokio::test]
async fn test_run_async_on_device() {
    let providers = default_providers().unwrap();
    let session = Session::builder(&providers).commit(add_graph()).unwrap();
    let a = Tensor::from_slice(&[2], &[0.5f32, 1.5]).unwrap();
    let b = Tensor::from_slice(&[2], &[2.0f32, -1.5]).unwrap();

    let outputs = session.run_async(&[("A", &a), ("B", &b)], &["C"]).await.unwrap();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![2.5, 0.0]);
    assert_eq!(session.phase(), RunPhase::Idle);
}

#[tokio::test]
async fn test_overlapping_async_runs_never_share_a_session() {
    let providers = default_providers().unwrap();
    let session = Session::builder(&providers).commit(add_graph()).unwrap();
    let a = Tensor::from_slice(&[2], &[1.0f32, 1.0]).unwrap();

    let inputs = [("A", &a), ("B", &a)];
    let (first, second) = tokio::join!(
        session.run_async(&inputs, &["C"]),
        session.run_async(&inputs, &["C"]),
    );
    assert_eq!(first.unwrap()[0].to_vec::<f32>().unwrap(), vec![2.0, 2.0]);
    match second {
        Ok(outputs) => assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![2.0, 2.0]),
        Err(e) => assert_eq!(e.code(), ErrorCode::SessionBusy),
    }
}

#[tokio::test]
async fn test_blocking_run_inside_runtime_is_rejected() {
    let providers = default_providers().unwrap();
    let session = Session::builder(&providers).commit(add_graph()).unwrap();
    let a = Tensor::from_slice(&[2], &[1.0f32, 2.0]).unwrap();

    let err = session.run(&[("A", &a), ("B", &a)], &["C"]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Configuration);
    assert!(err.to_string().contains("run_async"));
    let err = session.run_bound().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Configuration);
    assert_eq!(session.phase(), RunPhase::Idle);

    // the async entry point works on the same session
    let outputs = session.run_async(&[("A", &a), ("B", &a)], &["C"]).await.unwrap();
    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![2.0, 4.0]);
}
