//! Best-effort UDP connection to the collector daemon.
//!
//! Every closed segment is written as one datagram: the protocol header, a newline, and the JSON
//! document. Writes never wait: if the socket cannot take the datagram right away it is dropped
//! and logged. There are no retries.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Weak},
    time::Duration,
};

use arc_swap::ArcSwap;
use faststr::FastStr;
use tokio::net::{lookup_host, UdpSocket};

use crate::{
    config::XrayConfig,
    error::{ConnectionError, SendError},
    segment::SegmentDocument,
};

/// Header prepended to every segment document.
pub const PROTOCOL_HEADER: &[u8] = b"{\"format\": \"json\", \"version\": 1}\n";

/// Largest datagram the daemon accepts.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// A shared handle to the collector daemon.
///
/// Cloning is cheap and every clone writes through the same socket, which is safe to use from
/// many tasks at once.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    daemon: FastStr,
    socket: ArcSwap<UdpSocket>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("daemon", &self.shared.daemon)
            .field("local_addr", &self.local_addr().ok())
            .finish()
    }
}

impl Connection {
    /// Connects to the daemon at `daemon` (`host:port`), giving up after `dial_timeout`.
    pub async fn connect(
        daemon: impl Into<FastStr>,
        dial_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let daemon = daemon.into();
        let socket = dial(&daemon, dial_timeout).await?;
        tracing::info!(
            "[XRAY] connected to daemon {daemon} at {:?}",
            socket.peer_addr().ok()
        );
        Ok(Self {
            shared: Arc::new(Shared {
                daemon,
                socket: ArcSwap::from_pointee(socket),
            }),
        })
    }

    /// Connects using `config` and, if a non-zero renew period is configured, keeps re-dialing
    /// the daemon in the background so that address changes are picked up.
    ///
    /// Must be called within a tokio runtime.
    pub async fn from_config(config: &XrayConfig) -> Result<Self, ConnectionError> {
        let conn = Self::connect(config.daemon_address.clone(), config.dial_timeout).await?;
        if let Some(period) = config.renewal() {
            tokio::spawn(renew(
                Arc::downgrade(&conn.shared),
                period,
                config.dial_timeout,
            ));
        }
        Ok(conn)
    }

    /// The configured daemon address.
    pub fn daemon(&self) -> &FastStr {
        &self.shared.daemon
    }

    /// The resolved address of the daemon currently written to.
    pub fn daemon_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.load().peer_addr()
    }

    /// The local address datagrams are sent from.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.load().local_addr()
    }

    /// Sends `doc` to the daemon, logging and dropping it on failure.
    pub fn send(&self, doc: &SegmentDocument) {
        if let Err(e) = self.try_send(doc) {
            tracing::warn!(
                "[XRAY] drop segment {} of trace {}: {e}",
                doc.id,
                doc.trace_id
            );
        }
    }

    /// Sends `doc` to the daemon without waiting for the socket.
    pub fn try_send(&self, doc: &SegmentDocument) -> Result<(), SendError> {
        let datagram = encode(doc)?;
        self.shared.socket.load().try_send(&datagram)?;
        Ok(())
    }
}

/// Encodes `doc` into a single datagram.
pub fn encode(doc: &SegmentDocument) -> Result<Vec<u8>, SendError> {
    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(PROTOCOL_HEADER);
    serde_json::to_writer(&mut buf, doc)?;
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(SendError::Oversize {
            size: buf.len(),
            limit: MAX_DATAGRAM_SIZE,
        });
    }
    Ok(buf)
}

async fn dial(daemon: &FastStr, dial_timeout: Duration) -> Result<UdpSocket, ConnectionError> {
    let connect = async {
        let addr = lookup_host(daemon.as_str())
            .await
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no address resolved")
                })
            })
            .map_err(|source| ConnectionError::Resolve {
                addr: daemon.clone(),
                source,
            })?;

        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| ConnectionError::Io { addr, source })?;
        socket
            .connect(addr)
            .await
            .map_err(|source| ConnectionError::Io { addr, source })?;
        // try_send only succeeds once the reactor has seen the socket writable
        socket
            .writable()
            .await
            .map_err(|source| ConnectionError::Io { addr, source })?;
        Ok::<_, ConnectionError>(socket)
    };

    tokio::time::timeout(dial_timeout, connect)
        .await
        .map_err(|_| ConnectionError::Timeout {
            addr: daemon.clone(),
            timeout: dial_timeout,
        })?
}

async fn renew(shared: Weak<Shared>, period: Duration, dial_timeout: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match dial(&shared.daemon, dial_timeout).await {
            Ok(socket) => shared.socket.store(Arc::new(socket)),
            Err(e) => tracing::warn!("[XRAY] keep previous daemon socket: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_helpers::FakeDaemon;

    fn doc(id: &str) -> SegmentDocument {
        SegmentDocument {
            id: id.to_owned(),
            trace_id: "1-5759e988-bd862e3fe1be46a994272793".to_owned(),
            name: "svc".to_owned(),
            start_time: 1.5,
            end_time: Some(2.5),
            ..Default::default()
        }
    }

    #[test]
    fn encode_prefixes_header() {
        let datagram = encode(&doc("a")).unwrap();
        assert!(datagram.starts_with(PROTOCOL_HEADER));
        let body: serde_json::Value =
            serde_json::from_slice(&datagram[PROTOCOL_HEADER.len()..]).unwrap();
        assert_eq!(body["id"], "a");
        assert_eq!(body["end_time"], 2.5);
    }

    #[test]
    fn encode_rejects_oversize_documents() {
        let mut d = doc("a");
        d.name = "x".repeat(MAX_DATAGRAM_SIZE);
        assert!(matches!(encode(&d), Err(SendError::Oversize { .. })));
    }

    #[tokio::test]
    async fn send_reaches_daemon() {
        let daemon = FakeDaemon::bind().await;
        let conn = Connection::connect(daemon.addr().to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.daemon_addr().unwrap(), daemon.addr());

        conn.send(&doc("a"));
        let got = daemon.recv().await;
        assert_eq!(got["id"], "a");
    }

    #[tokio::test]
    async fn send_right_after_connect() {
        let daemon = FakeDaemon::bind().await;
        let conn = Connection::connect(daemon.addr().to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        conn.try_send(&doc("first")).unwrap();
        conn.try_send(&doc("second")).unwrap();

        assert_eq!(daemon.recv().await["id"], "first");
        assert_eq!(daemon.recv().await["id"], "second");
    }

    #[tokio::test]
    async fn zero_renew_period_disables_renewal() {
        let daemon = FakeDaemon::bind().await;
        let config: XrayConfig = serde_json::from_value(serde_json::json!({
            "service_name": "svc",
            "daemon_address": daemon.addr().to_string(),
            "renew_period": 0,
        }))
        .unwrap();
        let conn = Connection::from_config(&config).await.unwrap();

        let config = config.with_renew_period(Some(Duration::ZERO));
        let other = Connection::from_config(&config).await.unwrap();

        // no renewal task holds on to either connection
        assert_eq!(Arc::weak_count(&conn.shared), 0);
        assert_eq!(Arc::weak_count(&other.shared), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.try_send(&doc("a")).unwrap();
        other.try_send(&doc("b")).unwrap();
        assert_eq!(daemon.recv().await["id"], "a");
        assert_eq!(daemon.recv().await["id"], "b");
    }

    #[tokio::test]
    async fn concurrent_sends_are_all_delivered() {
        let daemon = FakeDaemon::bind().await;
        let conn = Connection::connect(daemon.addr().to_string(), Duration::from_secs(1))
            .await
            .unwrap();

        let tasks = (0..8)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.send(&doc(&i.to_string())) })
            })
            .collect::<Vec<_>>();
        for t in tasks {
            t.await.unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(daemon.recv().await["id"].as_str().unwrap().to_owned());
        }
        ids.sort();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4", "5", "6", "7"]);
    }

    #[tokio::test]
    async fn connect_fails_on_unresolvable_daemon() {
        let err = Connection::connect("no-such-host.invalid:2000", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Resolve { .. } | ConnectionError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn connect_fails_on_malformed_address() {
        let err = Connection::connect("missing-port", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Resolve { .. }));
    }

    #[tokio::test]
    async fn renewal_keeps_sending() {
        let daemon = FakeDaemon::bind().await;
        let config = XrayConfig::new("svc", daemon.addr().to_string())
            .with_renew_period(Some(Duration::from_millis(20)));
        let conn = Connection::from_config(&config).await.unwrap();
        assert_eq!(Arc::weak_count(&conn.shared), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.daemon_addr().unwrap(), daemon.addr());

        conn.send(&doc("after-renew"));
        assert_eq!(daemon.recv().await["id"], "after-renew");
    }
}
