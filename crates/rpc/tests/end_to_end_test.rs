//! End-to-end tests over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_rpc::{
    CheckStatus, DEFAULT_PROBE_TIMEOUT, DeliveryMode, MasterChecker, Message, PubsubConfig, PubsubHandler,
    PubsubListener, RequestOptions, RpcMaster, RpcMasterConfig, RpcWorker, RpcWorkerConfig,
    run_check,
};
use courier_transport::Headers;
use courier_transport_memory::{MemoryBroker, MemoryOptions, MemoryTransport};
use tokio::sync::mpsc;
use tokio::time::timeout;

const REQUESTS: &str = "echo.requests";

fn transport(broker: &MemoryBroker) -> Arc<MemoryTransport> {
    Arc::new(broker.transport(MemoryOptions::new("courier", REQUESTS)))
}

async fn start_worker(broker: &MemoryBroker) -> RpcWorker<MemoryTransport> {
    let worker = RpcWorker::new(transport(broker), RpcWorkerConfig::new("echo.worker"))
        .expect("Failed to create worker");

    worker.register("echo", |request: Message| async move {
        if request.payload().as_ref() == b"ping" {
            Ok::<_, String>(Bytes::from_static(b"pong"))
        } else {
            Ok(request.payload().clone())
        }
    });
    worker.register("broken", |_request: Message| async move {
        Err::<Bytes, _>("kaput".to_string())
    });

    worker.start().await.expect("Failed to start worker");
    worker
}

#[tokio::test]
async fn test_ping_pong_shared_and_standalone() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let worker = start_worker(&broker).await;
    let master = RpcMaster::new(transport(&broker), RpcMasterConfig::default())
        .expect("Failed to create master");

    for mode in [DeliveryMode::Shared, DeliveryMode::Standalone] {
        let task = master
            .request(
                Some("echo"),
                "ping",
                RequestOptions::default()
                    .mode(mode)
                    .timeout(Duration::from_millis(1000)),
            )
            .await
            .expect("Failed to send request");

        let response = timeout(Duration::from_secs(2), task.response())
            .await
            .expect("Timeout")
            .expect("Request failed");

        assert_eq!(response.text().unwrap(), "pong");
        assert_eq!(response.header("routineId"), Some("echo"));
        assert_eq!(response.header("requestId"), Some(task.request_id()));
        assert!(!master.has_task(task.correlation_id()));
    }

    master.close().await;
    worker.stop().await.expect("Failed to stop worker");
    assert_eq!(broker.consumer_count("courier.responses"), 0);
}

#[tokio::test]
async fn test_failed_routine_reports_status() {
    let broker = MemoryBroker::new();
    let _worker = start_worker(&broker).await;
    let master = RpcMaster::new(transport(&broker), RpcMasterConfig::default()).unwrap();

    let task = master
        .request(Some("broken"), "x", RequestOptions::default())
        .await
        .unwrap();
    let response = timeout(Duration::from_secs(2), task.response())
        .await
        .expect("Timeout")
        .unwrap();

    assert!(response.is_failed());
    assert_eq!(response.text().unwrap(), "kaput");
}

#[tokio::test]
async fn test_checker_against_running_and_missing_workers() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let master = Arc::new(
        RpcMaster::new(transport(&broker), RpcMasterConfig::default()).unwrap(),
    );
    let checker = MasterChecker::new(master.clone()).timeout(Duration::from_millis(100));

    let report = run_check(&checker).await;
    assert_eq!(report.status, CheckStatus::Failed);
    assert!(report.error.is_some());

    let _worker = start_worker(&broker).await;
    let report = run_check(&checker).await;
    assert!(report.is_ok(), "{report:?}");
    assert!(report.pong.unwrap().get("probeId").is_some());
    assert_eq!(master.task_count(), 0);
}

#[tokio::test]
async fn test_checker_bounds_ping_when_master_never_times_out() {
    let broker = MemoryBroker::new();
    let master = Arc::new(
        RpcMaster::new(
            transport(&broker),
            RpcMasterConfig::default().timeout(Duration::ZERO),
        )
        .unwrap(),
    );

    let checker = MasterChecker::new(master.clone()).timeout(Duration::ZERO);
    assert_eq!(checker.probe_timeout(), DEFAULT_PROBE_TIMEOUT);

    let report = timeout(DEFAULT_PROBE_TIMEOUT * 3, run_check(&checker))
        .await
        .expect("ping outlived its own timeout");
    assert_eq!(report.status, CheckStatus::Failed);
    assert_eq!(master.task_count(), 0);

    let checker = checker.timeout(Duration::from_millis(100));
    let report = timeout(Duration::from_secs(1), run_check(&checker))
        .await
        .expect("ping outlived its own timeout");
    assert_eq!(report.status, CheckStatus::Failed);
    assert_eq!(master.task_count(), 0);

    timeout(Duration::from_secs(1), master.close())
        .await
        .expect("abandoned pings kept the master busy");
}

struct Forwarder {
    sender: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl PubsubListener for Forwarder {
    async fn process_message(&self, message: Message) {
        let _ = self.sender.send(message);
    }
}

#[tokio::test]
async fn test_pubsub_delivers_with_headers() {
    let broker = MemoryBroker::new();
    let options = MemoryOptions::new("courier", "events");

    let subscriber = PubsubHandler::new(
        Arc::new(broker.transport(options.clone())),
        PubsubConfig::default().subscriber_name("events.audit"),
    )
    .expect("Failed to create subscriber");
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let handle = subscriber
        .subscribe(Arc::new(Forwarder { sender }))
        .await
        .expect("Failed to subscribe");
    assert_eq!(handle.queue_name, "events.audit");

    let publisher = PubsubHandler::new(
        Arc::new(broker.transport(options)),
        PubsubConfig::default(),
    )
    .unwrap();
    let mut headers = Headers::new();
    headers.insert("kind".to_string(), "login".to_string());
    publisher
        .publish("user-1", headers, None)
        .await
        .expect("Failed to publish");

    let message = timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("Timeout")
        .expect("closed");
    assert_eq!(message.text().unwrap(), "user-1");
    assert_eq!(message.header("kind"), Some("login"));

    subscriber.unsubscribe(&handle).await.unwrap();
    assert_eq!(subscriber.subscription_count(), 0);
    subscriber.close().await;
    publisher.close().await;
}

#[tokio::test]
async fn test_pubsub_rejects_empty_subscriber_name() {
    let broker = MemoryBroker::new();
    let result = PubsubHandler::new(
        transport(&broker),
        PubsubConfig::default().subscriber_name(""),
    );
    assert!(matches!(result, Err(courier_rpc::Error::Construction(_))));
}
