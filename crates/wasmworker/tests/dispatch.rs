//! Request correlation, dispatch and the close-then-reject-all policy.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::seq::SliceRandom;

use wasmworker::ChannelTransport;
use wasmworker::ClientConfig;
use wasmworker::Dispatch;
use wasmworker::Dispatcher;
use wasmworker::Transport;
use wasmworker::client::DispatchClient;
use wasmworker::client::Error;
use wasmworker::create_proxy;
use wasmworker::server::Shutdown;
use workrpc::DispatchResponse;
use workrpc::ErrorKind;
use workrpc::Frame;
use workrpc::RemoteError;
use workrpc::Value;

fn client_pair(config: ClientConfig) -> (DispatchClient, Arc<ChannelTransport>) {
    let (client_end, server_end) = ChannelTransport::pair();
    let client = DispatchClient::new("test-client", Box::new(client_end), config);
    (client, Arc::new(server_end))
}

async fn recv_request(server: &ChannelTransport) -> workrpc::DispatchRequest {
    let msg = server.recv().await.unwrap().expect("client hung up");
    match Frame::decode(&msg).unwrap() {
        Frame::Request(req) => req,
        other => panic!("Expected Request, got {:?}", other),
    }
}

/// Waits until the client has `n` requests in flight.
async fn wait_pending(client: &DispatchClient, n: usize) {
    for _ in 0..200 {
        if client.pending_len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} pending requests, have {}", n, client.pending_len());
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (client, server) = client_pair(ClientConfig::new());
    let client = Arc::new(client);

    const N: u32 = 16;
    let mut calls = Vec::new();
    for i in 0..N {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let value = client.request("double", vec![Value::U32(i)]).await.unwrap();
            (i, value)
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..N {
        requests.push(recv_request(&server).await);
    }
    requests.shuffle(&mut rand::thread_rng());
    for req in requests {
        let arg = req.args[0].as_u32().unwrap();
        let bytes = DispatchResponse::ok(req.id, Value::U32(arg * 2)).to_bytes().unwrap();
        server.send(&bytes).await.unwrap();
    }

    for call in calls {
        let (i, value) = call.await.unwrap();
        assert_eq!(value, Value::U32(i * 2));
    }
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn test_ids_are_never_reused() {
    let (client, server) = client_pair(ClientConfig::new());
    let client = Arc::new(client);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..5 {
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("ping", vec![]).await })
        };
        let req = recv_request(&server).await;
        assert!(seen.insert(req.id), "id {} reused", req.id);
        server.send(&DispatchResponse::ok(req.id, Value::Unit).to_bytes().unwrap()).await.unwrap();
        assert_eq!(call.await.unwrap().unwrap(), Value::Unit);
    }
}

#[tokio::test]
async fn test_peer_close_rejects_every_pending_request_once() {
    let (client, server) = client_pair(ClientConfig::new());
    let client = Arc::new(client);

    const N: usize = 8;
    let mut calls = Vec::new();
    for i in 0..N {
        let client = client.clone();
        calls.push(tokio::spawn(async move { client.request("slow", vec![Value::U32(i as u32)]).await }));
    }
    for _ in 0..N {
        recv_request(&server).await;
    }
    wait_pending(&client, N).await;

    server.close().await;

    for call in calls {
        match call.await.unwrap() {
            Err(Error::ConnectionClosed) => {}
            other => panic!("Expected ConnectionClosed, got {:?}", other),
        }
    }
    assert_eq!(client.pending_len(), 0);

    // the pump has finished by now, so the failure is immediate
    assert!(client.is_closed());
    assert!(matches!(client.request("late", vec![]).await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_local_close_rejects_pending_requests() {
    let (client, server) = client_pair(ClientConfig::new());
    let client = Arc::new(client);

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", vec![]).await })
    };
    recv_request(&server).await;
    wait_pending(&client, 1).await;

    client.close().await;

    assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed)));
    assert!(matches!(client.request("late", vec![]).await, Err(Error::ConnectionClosed)));
    // the worker end sees the close as end of stream
    assert!(server.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn test_request_timeout_clears_pending_entry() {
    let config = ClientConfig::new().request_timeout(Duration::from_millis(20));
    let (client, server) = client_pair(config);

    let result = client.request("never", vec![]).await;
    assert!(matches!(result, Err(Error::Timeout)), "got {:?}", result);
    assert_eq!(client.pending_len(), 0);

    // a late answer for the abandoned id is ignored
    let req = recv_request(&server).await;
    server.send(&DispatchResponse::ok(req.id, Value::Unit).to_bytes().unwrap()).await.unwrap();
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_remote_error_keeps_kind_and_message() {
    let (client, server) = client_pair(ClientConfig::new());
    let client = Arc::new(client);

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("async_call", vec![]).await })
    };
    let req = recv_request(&server).await;
    let error = RemoteError::new(ErrorKind::Host, "storage offline");
    server.send(&DispatchResponse::err(req.id, error.clone()).to_bytes().unwrap()).await.unwrap();

    match call.await.unwrap() {
        Err(Error::Remote(remote)) => assert_eq!(remote, error),
        other => panic!("Expected Remote, got {:?}", other),
    }
}

#[tokio::test]
async fn test_proxy_rejects_undeclared_methods_locally() {
    let (client_end, server_end) = ChannelTransport::pair();
    let proxy = create_proxy(["echo"], Box::new(client_end), ClientConfig::new()).unwrap();

    assert!(matches!(proxy.call("nope", vec![]).await, Err(Error::UnknownMethod(name)) if name == "nope"));
    assert!(matches!(
        proxy.call(workrpc::DESTROY_METHOD, vec![]).await,
        Err(Error::ReservedMethod(_))
    ));

    let nothing = tokio::time::timeout(Duration::from_millis(20), server_end.recv()).await;
    assert!(nothing.is_err(), "undeclared call reached the wire");
}

#[tokio::test]
async fn test_proxy_table_cannot_name_destroy() {
    let (client_end, _server_end) = ChannelTransport::pair();
    let result = create_proxy(["init", workrpc::DESTROY_METHOD], Box::new(client_end), ClientConfig::new());
    assert!(matches!(result, Err(Error::ReservedMethod(_))));
}

/// A dispatch target with a few canned behaviours.
struct Echo {
    torn_down: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Dispatch for Echo {
    async fn dispatch(&mut self, method: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        match method {
            "echo" => Ok(Value::List(args)),
            "fail" => Err(RemoteError::bad_arguments("fail always fails")),
            "boom" => panic!("boom went off"),
            other => Err(RemoteError::method_not_found(other)),
        }
    }

    async fn teardown(&mut self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_dispatcher_serves_until_destroyed() {
    let (client_end, server_end) = ChannelTransport::pair();
    let torn_down = Arc::new(AtomicBool::new(false));
    let target = Echo { torn_down: torn_down.clone() };
    let server = tokio::spawn(Dispatcher::new("echo-worker", target, Arc::new(server_end)).serve());

    let proxy = create_proxy(["echo", "fail", "boom", "missing"], Box::new(client_end), ClientConfig::new()).unwrap();

    let echoed = proxy.call("echo", vec![Value::from("a"), Value::U64(7)]).await.unwrap();
    assert_eq!(echoed, Value::List(vec![Value::from("a"), Value::U64(7)]));

    match proxy.call("fail", vec![]).await {
        Err(Error::Remote(e)) => assert_eq!(e.kind, ErrorKind::BadArguments),
        other => panic!("Expected Remote, got {:?}", other),
    }
    match proxy.call("boom", vec![]).await {
        Err(Error::Remote(e)) => {
            assert_eq!(e.kind, ErrorKind::Panicked);
            assert!(e.message.contains("boom went off"));
        }
        other => panic!("Expected Remote, got {:?}", other),
    }
    match proxy.call("missing", vec![]).await {
        Err(Error::Remote(e)) => assert_eq!(e.kind, ErrorKind::MethodNotFound),
        other => panic!("Expected Remote, got {:?}", other),
    }

    // still serving after a panic
    assert_eq!(proxy.call("echo", vec![]).await.unwrap(), Value::List(vec![]));

    proxy.destroy().await.unwrap();
    assert_eq!(server.await.unwrap().unwrap(), Shutdown::Destroyed);
    assert!(torn_down.load(Ordering::SeqCst));

    assert!(matches!(proxy.call("echo", vec![]).await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_dispatcher_stops_when_peer_goes_away() {
    let (client_end, server_end) = ChannelTransport::pair();
    let torn_down = Arc::new(AtomicBool::new(false));
    let target = Echo { torn_down: torn_down.clone() };
    let server = tokio::spawn(Dispatcher::new("echo-worker", target, Arc::new(server_end)).serve());

    client_end.close().await;

    assert_eq!(server.await.unwrap().unwrap(), Shutdown::PeerClosed);
    assert!(torn_down.load(Ordering::SeqCst));
}

/// Counts calls in a `Cell`, so it can move between threads but not be shared.
struct Counter {
    calls: std::cell::Cell<u64>,
}

#[async_trait::async_trait]
impl Dispatch for Counter {
    async fn dispatch(&mut self, _method: &str, _args: Vec<Value>) -> Result<Value, RemoteError> {
        self.calls.set(self.calls.get() + 1);
        Ok(Value::U64(self.calls.get()))
    }
}

#[tokio::test]
async fn test_dropping_the_client_ends_a_spawned_dispatcher() {
    let (client_end, server_end) = ChannelTransport::pair();
    let target = Counter { calls: std::cell::Cell::new(0) };
    let server = tokio::spawn(Dispatcher::new("counter", target, Arc::new(server_end)).serve());

    let client = DispatchClient::new("test-client", Box::new(client_end), ClientConfig::new());
    assert_eq!(client.request("tick", vec![]).await.unwrap(), Value::U64(1));
    assert_eq!(client.request("tick", vec![]).await.unwrap(), Value::U64(2));

    drop(client);

    let shutdown = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap();
    assert_eq!(shutdown.unwrap().unwrap(), Shutdown::PeerClosed);
}
