use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tunnel_connector::proto::{self, ServiceStatus, ServiceType};
use tunnel_connector::{
    connect, Connector, ConnectorConfig, Error, Integration, LocalIntegration, RpcGuard,
    RpcServer, ServiceDetails,
};

const WAIT: Duration = Duration::from_secs(10);

/// Local integration that records every call.
#[derive(Debug, Default)]
struct RecordingIntegration {
    inner: LocalIntegration,
    registered: Mutex<Vec<(String, ServiceType)>>,
    deregistered: Mutex<Vec<String>>,
}

impl RecordingIntegration {
    fn registered(&self) -> Vec<(String, ServiceType)> {
        self.registered.lock().unwrap().clone()
    }

    fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Integration for RecordingIntegration {
    async fn register(
        &self,
        id: &str,
        kind: ServiceType,
        config: &HashMap<String, String>,
    ) -> tunnel_connector::Result<ServiceDetails> {
        self.registered.lock().unwrap().push((id.to_string(), kind));
        self.inner.register(id, kind, config).await
    }

    async fn deregister(&self, id: &str) -> tunnel_connector::Result<()> {
        self.deregistered.lock().unwrap().push(id.to_string());
        self.inner.deregister(id).await
    }

    async fn lookup_address(&self, id: &str) -> tunnel_connector::Result<String> {
        self.inner.lookup_address(id).await
    }

    async fn get_details(&self, id: &str) -> tunnel_connector::Result<HashMap<String, String>> {
        self.inner.get_details(id).await
    }
}

struct Node {
    guard: RpcGuard,
    integration: Arc<RecordingIntegration>,
}

impl Node {
    fn connector(&self) -> &Connector {
        self.guard.connector()
    }

    fn addr(&self) -> String {
        self.guard.local_addr().to_string()
    }
}

fn config() -> ConnectorConfig {
    ConnectorConfig::default()
        .with_reconnect_backoff(Duration::from_millis(200))
        .with_connect_timeout(Duration::from_secs(1))
        .with_listen_host("127.0.0.1")
}

async fn start_node_on(addr: &str) -> Node {
    let integration = Arc::new(RecordingIntegration::default());
    let connector = Connector::new(integration.clone(), config());
    let listener = TcpListener::bind(addr).await.unwrap();
    let guard = RpcServer::new(connector).serve(listener).await.unwrap();
    Node { guard, integration }
}

async fn start_node() -> Node {
    start_node_on("127.0.0.1:0").await
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo server that also records everything it receives.
async fn echo_backend() -> (SocketAddr, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let record = received.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let record = record.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            record.lock().unwrap().extend_from_slice(&buf[..n]);
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, received)
}

/// Echo server that reports every connection it sees closed.
async fn closing_backend() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = closed_tx.send(seen);
            });
        }
    });

    (addr, closed_rx)
}

async fn next_closed(closed: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    timeout(WAIT, closed.recv())
        .await
        .expect("backend connection was never closed")
        .expect("backend stopped")
}

fn route(kind: ServiceType, peer: &str, port: u16, backend: &str) -> proto::Service {
    let mut svc = proto::Service {
        name: "Test Service".into(),
        source_port: i32::from(port),
        destination_addr: backend.into(),
        remote_connector_addr: peer.into(),
        ..Default::default()
    };
    svc.set_type(kind);
    svc
}

fn status_of(connector: &Connector, id: &str) -> Option<ServiceStatus> {
    connector
        .list_services()
        .into_iter()
        .find(|svc| svc.id == id)
        .map(|svc| svc.status())
}

async fn wait_for_status(connector: &Connector, id: &str, status: ServiceStatus) {
    timeout(WAIT, async {
        while status_of(connector, id) != Some(status) {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("service {id} never reached {status:?}"));
}

async fn can_dial(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

async fn wait_for_dial(port: u16, reachable: bool) {
    timeout(WAIT, async {
        while can_dial(port).await != reachable {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("port {port} never became reachable={reachable}"));
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(WAIT, stream.read_exact(&mut echoed))
        .await
        .expect("no echo in time")
        .unwrap();
    assert_eq!(echoed, payload);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn remote_service_relays_traffic() {
    let consumer = start_node().await;
    let exporter = start_node().await;
    let (backend, received) = echo_backend().await;
    let port = free_port();

    let id = consumer
        .connector()
        .expose_service(route(
            ServiceType::Remote,
            &exporter.addr(),
            port,
            &backend.to_string(),
        ))
        .await
        .unwrap();

    wait_for_status(consumer.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    round_trip(&mut stream, b"abc123").await;
    round_trip(&mut stream, b"123abc").await;
    assert_eq!(received.lock().unwrap().as_slice(), b"abc123123abc");

    // the exporter mirrored the route as the backend side
    let mirrored = exporter.connector().list_services();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].id, id);
    assert_eq!(mirrored[0].status(), ServiceStatus::Complete);
    assert!(exporter
        .integration
        .registered()
        .contains(&(id.clone(), ServiceType::Local)));
    assert!(consumer
        .integration
        .registered()
        .contains(&(id, ServiceType::Remote)));

    consumer.guard.shutdown().await.unwrap();
    exporter.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn local_service_is_published_on_peer() {
    let exporter = start_node().await;
    let consumer = start_node().await;
    let (backend, received) = echo_backend().await;
    let port = free_port();

    let id = exporter
        .connector()
        .expose_service(route(
            ServiceType::Local,
            &consumer.addr(),
            port,
            &backend.to_string(),
        ))
        .await
        .unwrap();

    wait_for_status(exporter.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;

    let details = exporter
        .connector()
        .list_services()
        .into_iter()
        .find(|svc| svc.id == id)
        .unwrap()
        .details;
    assert_eq!(details["address"], format!("localhost:{port}"));

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    round_trip(&mut first, b"abc123").await;
    round_trip(&mut second, b"xyz").await;
    round_trip(&mut first, b"123abc").await;
    assert_eq!(received.lock().unwrap().len(), 15);

    exporter.guard.shutdown().await.unwrap();
    consumer.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn duplicate_routes_are_rejected() {
    let node = start_node().await;
    let connector = node.connector();

    let first = connector
        .expose_service(route(ServiceType::Remote, "127.0.0.1:1", 9090, ""))
        .await
        .unwrap();
    let err = connector
        .expose_service(route(ServiceType::Remote, "127.0.0.1:2", 9090, ""))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert!(err.to_string().contains("already in use"));

    connector
        .expose_service(route(ServiceType::Local, "127.0.0.1:1", 9091, "127.0.0.1:80"))
        .await
        .unwrap();
    assert!(connector
        .expose_service(route(ServiceType::Local, "127.0.0.1:1", 9091, "127.0.0.1:81"))
        .await
        .is_err());
    connector
        .expose_service(route(ServiceType::Local, "127.0.0.1:3", 9091, "127.0.0.1:80"))
        .await
        .unwrap();

    let services = connector.list_services();
    assert_eq!(services.len(), 3);
    assert!(services.iter().any(|svc| svc.id == first));

    node.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn destroy_removes_peer_listener() {
    let exporter = start_node().await;
    let consumer = start_node().await;
    let (backend, _) = echo_backend().await;
    let port = free_port();

    let id = exporter
        .connector()
        .expose_service(route(
            ServiceType::Local,
            &consumer.addr(),
            port,
            &backend.to_string(),
        ))
        .await
        .unwrap();
    wait_for_status(exporter.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;

    exporter.connector().destroy_service(&id).await.unwrap();
    assert!(exporter.connector().list_services().is_empty());
    assert!(matches!(
        exporter.connector().destroy_service(&id).await,
        Err(Error::NotFound(_))
    ));

    wait_for_dial(port, false).await;
    timeout(WAIT, async {
        while !consumer.integration.deregistered().contains(&id) {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("peer never deregistered the service");
    assert!(consumer.connector().list_services().is_empty());

    exporter.guard.shutdown().await.unwrap();
    consumer.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn routes_recover_after_peer_restart() {
    let exporter = start_node().await;
    let consumer = start_node().await;
    let consumer_addr = consumer.addr();
    let (backend, _) = echo_backend().await;
    let port = free_port();

    let id = exporter
        .connector()
        .expose_service(route(
            ServiceType::Local,
            &consumer_addr,
            port,
            &backend.to_string(),
        ))
        .await
        .unwrap();
    wait_for_status(exporter.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;

    consumer.guard.shutdown().await.unwrap();
    wait_for_dial(port, false).await;
    wait_for_status(exporter.connector(), &id, ServiceStatus::Pending).await;

    let restarted = start_node_on(&consumer_addr).await;
    wait_for_status(exporter.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    round_trip(&mut stream, b"abc123").await;

    exporter.guard.shutdown().await.unwrap();
    restarted.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn shutdown_closes_listeners() {
    let consumer = start_node().await;
    let exporter = start_node().await;
    let (backend, _) = echo_backend().await;
    let port = free_port();

    let id = consumer
        .connector()
        .expose_service(route(
            ServiceType::Remote,
            &exporter.addr(),
            port,
            &backend.to_string(),
        ))
        .await
        .unwrap();
    wait_for_status(consumer.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;

    let connector = consumer.connector().clone();
    consumer.guard.shutdown().await.unwrap();
    assert!(connector.is_shutdown());
    assert!(!can_dial(port).await);
    assert!(consumer.integration.deregistered().contains(&id));

    exporter.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn rpc_surface_drives_the_connector() {
    let consumer = start_node().await;
    let exporter = start_node().await;
    let (backend, _) = echo_backend().await;
    let port = free_port();

    let mut client = connect(&consumer.addr(), &config()).await.unwrap();
    let id = client
        .expose_service(proto::ExposeRequest {
            service: Some(route(
                ServiceType::Remote,
                &exporter.addr(),
                port,
                &backend.to_string(),
            )),
        })
        .await
        .unwrap()
        .into_inner()
        .id;

    let duplicate = client
        .expose_service(proto::ExposeRequest {
            service: Some(route(
                ServiceType::Remote,
                &exporter.addr(),
                port,
                &backend.to_string(),
            )),
        })
        .await
        .unwrap_err();
    assert_eq!(duplicate.code(), tonic::Code::AlreadyExists);

    wait_for_status(consumer.connector(), &id, ServiceStatus::Complete).await;
    let listed = client
        .list_services(proto::NullMessage {})
        .await
        .unwrap()
        .into_inner()
        .services;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].config["name"], "test-service");

    client
        .destroy_service(proto::DestroyRequest { id: id.clone() })
        .await
        .unwrap();
    let missing = client
        .destroy_service(proto::DestroyRequest { id })
        .await
        .unwrap_err();
    assert_eq!(missing.code(), tonic::Code::NotFound);
    wait_for_dial(port, false).await;

    drop(client);
    consumer.guard.shutdown().await.unwrap();
    exporter.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn client_close_reaches_backend() {
    let consumer = start_node().await;
    let exporter = start_node().await;
    let (backend, mut closed) = closing_backend().await;
    let port = free_port();

    let id = consumer
        .connector()
        .expose_service(route(
            ServiceType::Remote,
            &exporter.addr(),
            port,
            &backend.to_string(),
        ))
        .await
        .unwrap();
    wait_for_status(consumer.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;
    // the readiness dials above open and close backend connections too
    sleep(Duration::from_millis(200)).await;
    while closed.try_recv().is_ok() {}

    // half-close after a short write
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    round_trip(&mut stream, b"hello").await;
    stream.shutdown().await.unwrap();
    assert_eq!(next_closed(&mut closed).await, b"hello");

    // the route keeps serving new connections
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    round_trip(&mut stream, b"again").await;
    drop(stream);
    assert_eq!(next_closed(&mut closed).await, b"again");
    assert_eq!(
        status_of(consumer.connector(), &id),
        Some(ServiceStatus::Complete)
    );

    consumer.guard.shutdown().await.unwrap();
    exporter.guard.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn closing_one_connection_keeps_its_sibling() {
    let consumer = start_node().await;
    let exporter = start_node().await;
    let (backend, mut closed) = closing_backend().await;
    let port = free_port();

    let id = consumer
        .connector()
        .expose_service(route(
            ServiceType::Remote,
            &exporter.addr(),
            port,
            &backend.to_string(),
        ))
        .await
        .unwrap();
    wait_for_status(consumer.connector(), &id, ServiceStatus::Complete).await;
    wait_for_dial(port, true).await;
    sleep(Duration::from_millis(200)).await;
    while closed.try_recv().is_ok() {}

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    round_trip(&mut first, b"first").await;
    round_trip(&mut second, b"second").await;

    drop(first);
    assert_eq!(next_closed(&mut closed).await, b"first");

    round_trip(&mut second, b"still here").await;
    assert!(closed.try_recv().is_err());

    consumer.guard.shutdown().await.unwrap();
    exporter.guard.shutdown().await.unwrap();
}
