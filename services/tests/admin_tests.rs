//! Admin channel tests over in-memory links.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use network::fiber::Demux;
use services::{run_admin_server, AdminClient, Parameters, RunningService, ServiceRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const ECHO_PORT: u32 = 5000;

fn echo_factory(started: Arc<AtomicUsize>) -> impl Fn(Demux, &Parameters) -> anyhow::Result<RunningService> {
    move |demux, _parameters| {
        let listener = demux
            .bind(ECHO_PORT)
            .map_err(|e| anyhow::anyhow!("cannot bind echo port: {e}"))?;
        started.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(async move {
            while let Ok(mut fiber) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    fiber.read_to_end(&mut buf).await.unwrap();
                    fiber.write_all(&buf).await.unwrap();
                    fiber.shutdown().await.unwrap();
                });
            }
        });
        Ok(RunningService::new(99, task))
    }
}

async fn setup() -> (Demux, Arc<AtomicUsize>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Demux::new(a);
    let server = Demux::new(b);
    let started = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(99, echo_factory(started.clone())).unwrap();
    tokio::spawn(run_admin_server(server, registry));
    tokio::task::yield_now().await;
    (client, started)
}

#[tokio::test]
async fn test_create_use_stop_service() {
    let (client, started) = setup().await;
    let mut admin = AdminClient::connect(&client).await.unwrap();

    let unique_id = admin.create_service(99, Parameters::new()).await.unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 1);

    // the created service is reachable over its fiber port
    let mut fiber = client.connect(ECHO_PORT).await.unwrap();
    fiber.write_all(b"ping").await.unwrap();
    fiber.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    fiber.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"ping");

    admin.stop_service(unique_id).await.unwrap();
    // stopping it again fails
    assert!(admin.stop_service(unique_id).await.is_err());
}

#[tokio::test]
async fn test_unknown_service_id_refused() {
    let (client, _started) = setup().await;
    let mut admin = AdminClient::connect(&client).await.unwrap();
    assert!(admin.create_service(1234, Parameters::new()).await.is_err());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let registry = ServiceRegistry::new();
    let started = Arc::new(AtomicUsize::new(0));
    registry.register(7, echo_factory(started.clone())).unwrap();
    assert!(registry.register(7, echo_factory(started)).is_err());
    assert!(registry.is_registered(7));
    registry.unregister(7);
    assert!(!registry.is_registered(7));
}
