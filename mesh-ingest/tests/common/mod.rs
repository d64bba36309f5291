#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use mesh_ingest::config::Config;
use mesh_ingest::server::serve;

pub const NODE: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
pub const GATEWAY_1: &str = "1111111111111111111111111111111111111111111111111111111111111111";
pub const GATEWAY_2: &str = "2222222222222222222222222222222222222222222222222222222222222222";
pub const GATEWAY_3: &str = "3333333333333333333333333333333333333333333333333333333333333333";

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Configuration for a server that never reaches its broker and keeps state in memory.
pub async fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut env = HashMap::from([
        ("BROKER_HOST".to_owned(), "127.0.0.1".to_owned()),
        ("BROKER_PORT".to_owned(), closed_port().await.to_string()),
        ("BROKER_RECONNECT_INITIAL_MS".to_owned(), "10".to_owned()),
        ("BROKER_RECONNECT_MAX_MS".to_owned(), "50".to_owned()),
        ("EXPORT_PROMETHEUS".to_owned(), "false".to_owned()),
        ("RETENTION_ENABLED".to_owned(), "false".to_owned()),
        ("SHUTDOWN_TIMEOUT_SECS".to_owned(), "5".to_owned()),
    ]);
    for (key, value) in extra {
        env.insert((*key).to_owned(), (*value).to_owned());
    }
    Config::init_from_hashmap(&env).unwrap()
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    pub served: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let served = tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            shutdown,
            served,
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::get(format!("http://{}{}", self.addr, path))
            .await
            .expect("failed to send request")
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.notify_one();
        self.served.await.expect("server task panicked")
    }
}

/// Serve a bare router on an ephemeral port.
pub async fn serve_router(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(waited.is_ok(), "timed out waiting for {what}");
}
