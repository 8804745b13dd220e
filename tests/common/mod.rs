//! Shared helpers for the integration suite.

use std::net::SocketAddr;
use std::sync::Arc;

use postoffice::PostOfficeConfig;
use postoffice::broker::BrokerTransport;
use postoffice::readiness::Readiness;
use postoffice::rest_api::{AppState, create_app};
use postoffice::test_support::MockBroker;

/// A broker instance listening on an OS-assigned port.
pub struct TestApp {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub broker: Arc<MockBroker>,
}

#[allow(dead_code)]
impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/{query}", self.addr)
    }
}

/// Polls a condition until it holds or a two second budget runs out.
#[allow(dead_code)]
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Builds the full component graph around a [`MockBroker`] and serves it.
pub async fn spawn_app(broker_connected: bool, allow_degraded_ready: bool) -> TestApp {
    let readiness = Arc::new(Readiness::new(allow_degraded_ready));
    if broker_connected {
        readiness.set_broker_connected(true);
        readiness.set_broker_healthy(true);
    }
    let broker = Arc::new(MockBroker::new(broker_connected));
    let state = AppState::build(
        PostOfficeConfig::default(),
        Arc::clone(&broker) as Arc<dyn BrokerTransport>,
        readiness,
    )
    .expect("state builds");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let app = create_app(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test app");
    });

    TestApp {
        addr,
        state,
        broker,
    }
}
