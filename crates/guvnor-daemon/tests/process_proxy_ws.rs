//! Process proxy against a real WebSocket endpoint on loopback.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use guvnor_daemon::{ProcessEvent, ProcessProxy, ProxyError, TimeoutPolicy};
use guvnor_process::{ConnectionState, ProcessId};
use guvnor_rpc::{ChannelOptions, Endpoint, WsChannelFactory};
use serde_json::{Value, json};
use tokio::net::TcpListener;

async fn spawn_process(endpoint: Endpoint) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(endpoint.serve(listener));
    format!("ws://{addr}")
}

fn supervised(restarts: Arc<AtomicUsize>) -> Endpoint {
    Endpoint::new()
        .method("reportStatus", |_args, _emitter| async {
            Ok::<_, String>(json!({ "pid": 4242, "status": "running" }))
        })
        .method("restart", move |_args, emitter| {
            // Counted when the request is read, so numbering follows arrival order.
            let n = restarts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                emitter.emit("process:restarted", vec![json!(n)]);
                Ok::<_, String>(json!(n))
            }
        })
        .method("kill", |_args, _emitter| async { Err::<Value, _>("refusing to die".to_string()) })
        .method("dumpHeap", |_args, _emitter| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, String>(json!("/tmp/heap.heapsnapshot"))
        })
        .method("setClusterWorkers", |_args, _emitter| async {
            // Never answers: stands in for a wedged process.
            std::future::pending::<()>().await;
            Ok::<_, String>(Value::Null)
        })
}

fn proxy(target: &str, timeout: Duration) -> ProcessProxy {
    let factory = WsChannelFactory::new(ChannelOptions {
        handshake_timeout: Some(Duration::from_secs(5)),
        token: None,
    });
    ProcessProxy::new(
        ProcessId::from("web-1"),
        target,
        true,
        Arc::new(factory),
        TimeoutPolicy::new(timeout),
    )
}

#[tokio::test]
async fn calls_before_connect_are_replayed_over_the_socket() {
    let restarts = Arc::new(AtomicUsize::new(0));
    let target = spawn_process(supervised(restarts.clone())).await;
    let proxy = proxy(&target, Duration::from_secs(5));
    let mut events = proxy.subscribe();

    let first = proxy.restart(vec![]);
    let second = proxy.restart(vec![]);
    let status = proxy.report_status(vec![]);

    assert_eq!(first.await.unwrap(), json!(1));
    assert_eq!(second.await.unwrap(), json!(2));
    assert_eq!(status.await.unwrap()["pid"], json!(4242));
    assert_eq!(proxy.connection(), ConnectionState::Connected);

    assert_eq!(
        events.recv().await.unwrap(),
        ProcessEvent {
            name: "process:restarted".to_string(),
            args: vec![json!(1)],
        }
    );
}

#[tokio::test]
async fn remote_errors_and_missing_methods_surface_as_invocation_errors() {
    let target = spawn_process(supervised(Arc::default())).await;
    let proxy = proxy(&target, Duration::from_secs(5));

    assert_eq!(
        proxy.kill(vec![json!("SIGKILL")]).await.unwrap_err(),
        ProxyError::Invocation {
            method: "kill".to_string(),
            message: "refusing to die".to_string(),
        }
    );
    assert!(matches!(
        proxy.force_gc(vec![]).await,
        Err(ProxyError::Invocation { .. })
    ));
}

#[tokio::test]
async fn bounded_calls_time_out_while_diagnostics_wait() {
    let target = spawn_process(supervised(Arc::default())).await;
    let proxy = proxy(&target, Duration::from_millis(100));
    let cluster = proxy.as_cluster().unwrap();

    let err = cluster.set_cluster_workers(vec![json!(4)]).await.unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }));

    // Slower than the timeout, but exempt from it.
    assert_eq!(proxy.dump_heap(vec![]).await.unwrap(), json!("/tmp/heap.heapsnapshot"));
}

#[tokio::test]
async fn unreachable_process_fails_queued_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let proxy = proxy(&format!("ws://{addr}"), Duration::from_secs(5));

    let a = proxy.restart(vec![]);
    let b = proxy.report_status(vec![]);

    assert!(matches!(a.await, Err(ProxyError::Connection(_))));
    assert!(matches!(b.await, Err(ProxyError::Connection(_))));
    assert_eq!(proxy.connection(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_then_reuse_reconnects() {
    let restarts = Arc::new(AtomicUsize::new(0));
    let target = spawn_process(supervised(restarts.clone())).await;
    let proxy = proxy(&target, Duration::from_secs(5));

    proxy.connect().await.unwrap();
    proxy.disconnect().await;
    assert_eq!(proxy.connection(), ConnectionState::Disconnected);

    assert_eq!(proxy.restart(vec![]).await.unwrap(), json!(1));
    assert_eq!(proxy.connection(), ConnectionState::Connected);
}
