//! Listening socket, blacklist enforcement, and the heartbeat ticker.
//!
//! The blacklist check happens as a pre-accept-loop refusal: we reject a
//! peer before ever constructing a [`crate::session::Shared`]-backed task
//! rather than after, since `TcpListener` has no "build or refuse" hook.
//! Startup/heartbeat/shutdown are a spawned ticker task cancelled on
//! shutdown, and the broadcast engine's unconditional fan-out is reused
//! for the `#DL` wind-delta heartbeat packet. The accept loop spawns one
//! `tokio::spawn` task per connection with a monotonic connection id for
//! log correlation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::packet::{concat, encode, Command};
use crate::plugin::PluginManager;
use crate::registry::ClientRegistry;
use crate::session::{handle_connection, Shared};

/// Interval between `#DL` wind-delta heartbeat packets.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(70);

/// Accept connections on `shared.config.port`, refusing any whose peer
/// address matches `shared.config.blacklist`, until `shutdown` fires.
/// Runs the heartbeat ticker alongside the accept loop and tears both down
/// together on shutdown.
pub async fn run(shared: Shared, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], shared.config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("fsdd listening on {}", addr);

    let heartbeat_registry = shared.registry.clone();
    let mut heartbeat_shutdown = shutdown.resubscribe();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // consume the immediate first tick - the first heartbeat fires after one full interval
        loop {
            tokio::select! {
                _ = ticker.tick() => heartbeat_tick(&heartbeat_registry),
                _ = heartbeat_shutdown.recv() => break,
            }
        }
    });

    shared.plugins.fire_before_start().await;

    let mut connection_id: u64 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("accept error: {:#}", err);
                        continue;
                    }
                };
                connection_id += 1;
                let id = connection_id;

                if shared.config.blacklist.iter().any(|blocked| blocked == &peer.ip().to_string()) {
                    info!(connection_id = id, peer = %peer, "refused connection from blacklisted host");
                    continue;
                }

                info!(connection_id = id, peer = %peer, "accepted connection");
                metrics::gauge!("fsdd.connections.active").increment(1.0);
                metrics::counter!("fsdd.connections.accepted_total").increment(1);

                let conn_shared = shared.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer.to_string(), conn_shared).await;
                    metrics::gauge!("fsdd.connections.active").decrement(1.0);
                    info!(connection_id = id, "connection closed");
                });
            }
            _ = shutdown.recv() => {
                info!("shutting down: no longer accepting new connections");
                break;
            }
        }
    }

    shared.plugins.fire_before_stop().await;
    shared.metar.stop_cron();
    heartbeat.abort();
    let _ = heartbeat.await;
    Ok(())
}

/// A `#DL` wind-delta packet broadcast to every connected client, `*`
/// multicast with no exclusion. The historic range is drawn from
/// `[-214743648, 2147483647]` (note the narrowed lower bound, one digit
/// short of `i32::MIN` - preserved rather than corrected) and folded into
/// `[-5, 5]`/`[-10, 10]` via an always-non-negative modulo, so `rem_euclid`
/// is used here rather than Rust's sign-preserving `%`.
fn heartbeat_tick(registry: &ClientRegistry) {
    let random_int: i64 = rand::rng().random_range(-214_743_648..=2_147_483_647);
    let delta_a = random_int.rem_euclid(11) - 5;
    let delta_b = random_int.rem_euclid(21) - 10;

    let head = concat(Command::WindDelta, b"SERVER");
    let packet = encode([head.as_slice(), b"*", delta_a.to_string().as_bytes(), delta_b.to_string().as_bytes()]);

    let mut line = packet;
    line.extend_from_slice(b"\r\n");
    for client in registry.snapshot() {
        registry.send_to(&client.callsign, line.clone());
    }
}

/// Build the shared state every accepted connection will read from. Kept
/// separate from [`run`] so callers (tests, `main`) can construct it
/// without also starting the listener.
pub fn build_shared(
    credentials: Arc<dyn crate::auth::Authenticator>,
    metar: Arc<crate::weather::manager::MetarManager>,
    plugins: Arc<PluginManager>,
    config: Arc<crate::config::ServerConfig>,
) -> Shared {
    Shared::new(ClientRegistry::new(), credentials, metar, plugins, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LoginResult;
    use crate::client::{Client, ClientType};
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct AlwaysAuthorized;

    #[async_trait]
    impl crate::auth::Authenticator for AlwaysAuthorized {
        async fn login(&self, _cid: &str, _password: &str) -> Result<LoginResult> {
            Ok(LoginResult::Authorized { rating: 5 })
        }
    }

    fn test_shared(port: u16, blacklist: Vec<String>) -> Shared {
        build_shared(
            Arc::new(AlwaysAuthorized),
            Arc::new(crate::weather::manager::MetarManager::for_test(vec![])),
            Arc::new(PluginManager::new()),
            Arc::new(crate::config::ServerConfig {
                port,
                blacklist,
                motd: Vec::new(),
                motd_encoding: "UTF-8".to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn heartbeat_reaches_every_connected_client() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.insert(Client::new(ClientType::Pilot, b"N1AB".to_vec(), 1, "100001".into(), 9, b"".to_vec(), 0), tx);

        heartbeat_tick(&registry);

        let msg = rx.try_recv().expect("heartbeat did not reach the registered client");
        let bytes = match msg {
            crate::registry::OutboundMessage::Write(bytes) => bytes,
            crate::registry::OutboundMessage::Close => panic!("expected Write"),
        };
        assert!(bytes.starts_with(b"#DLSERVER:*:"));
    }

    #[tokio::test]
    async fn accept_loop_refuses_blacklisted_peers() {
        let shared = test_shared(0, vec!["127.0.0.1".to_string()]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let conn_shared = shared.clone();
        let server = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted.unwrap();
                        if conn_shared.config.blacklist.iter().any(|b| b == &peer.ip().to_string()) {
                            continue;
                        }
                        let s = conn_shared.clone();
                        tokio::spawn(async move { handle_connection(stream, peer.to_string(), s).await; });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        // 127.0.0.1 is blacklisted: the connection is accepted at the TCP
        // level but the server never reads from or writes to it.
        let mut blocked = TcpStream::connect(addr).await.unwrap();
        blocked.write_all(b"#APN1AB:SERVER:100001:pw:1:9:0:Test\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(150), blocked.read(&mut buf)).await;
        assert!(read.is_err(), "blacklisted peer should receive nothing");

        let _ = shutdown_tx.send(());
        server.await.unwrap();
    }
}
