//! Generic test utilities.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use futures::stream;
use motore::Service;
use tokio::net::UdpSocket;

use crate::{
    context::{ClientContext, ServerContext},
    request::Request,
    response::Response,
    status::Status,
    transport::{Connection, PROTOCOL_HEADER},
    BoxStream,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A collector daemon listening on a random loopback port.
pub struct FakeDaemon {
    socket: UdpSocket,
}

impl FakeDaemon {
    pub async fn bind() -> Self {
        init_logging();
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind fake daemon");
        Self { socket }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("fake daemon address")
    }

    /// Connects to this daemon without background re-dialing.
    pub async fn connect(&self) -> Connection {
        Connection::connect(self.addr().to_string(), Duration::from_secs(1))
            .await
            .expect("connect to fake daemon")
    }

    /// Waits for the next datagram, checks the protocol header and parses the document.
    pub async fn recv(&self) -> serde_json::Value {
        let mut buf = vec![0; 64 * 1024];
        let n = tokio::time::timeout(RECV_TIMEOUT, self.socket.recv(&mut buf))
            .await
            .expect("no datagram received")
            .expect("recv datagram");
        let datagram = &buf[..n];
        assert!(
            datagram.starts_with(PROTOCOL_HEADER),
            "datagram without protocol header: {}",
            String::from_utf8_lossy(datagram)
        );
        serde_json::from_slice(&datagram[PROTOCOL_HEADER.len()..]).expect("parse segment document")
    }

    /// Asserts that nothing else arrives for a short while.
    pub async fn assert_idle(&self) {
        let mut buf = vec![0; 64 * 1024];
        let got = tokio::time::timeout(Duration::from_millis(100), self.socket.recv(&mut buf)).await;
        if let Ok(Ok(n)) = got {
            panic!(
                "unexpected datagram: {}",
                String::from_utf8_lossy(&buf[..n])
            );
        }
    }
}

/// Installs a subscriber printing through the test harness, once per test binary.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Creates a server context for `method` called from `127.0.0.1:8000`.
pub fn server_cx(method: &'static str) -> ServerContext {
    ServerContext::new(method).with_peer(SocketAddr::from((Ipv4Addr::LOCALHOST, 8000)))
}

/// What a [`MockHandler`] does with a call.
#[derive(Clone)]
pub enum Outcome {
    Echo,
    Fail(Status),
    Panic,
}

/// A handler that echoes the request message, fails or panics.
///
/// It records the context and metadata it was called with, so tests can inspect what the
/// layers in front of it did.
#[derive(Clone)]
pub struct MockHandler {
    outcome: Outcome,
    seen: std::sync::Arc<parking_lot::Mutex<Vec<Seen>>>,
}

/// A call observed by a [`MockHandler`].
#[derive(Clone, Debug)]
pub struct Seen {
    pub metadata: crate::metadata::MetadataMap,
    pub request_id: Option<faststr::FastStr>,
    pub segment: Option<crate::segment::Segment>,
}

impl MockHandler {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            seen: Default::default(),
        }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    fn respond(&self, seen: Seen, message: String) -> Result<Response<String>, Status> {
        self.seen.lock().push(seen);
        match &self.outcome {
            Outcome::Echo => Ok(Response::new(message)),
            Outcome::Fail(status) => Err(status.clone()),
            Outcome::Panic => panic!("handler panicked"),
        }
    }
}

impl Service<ServerContext, Request<String>> for MockHandler {
    type Response = Response<String>;
    type Error = Status;

    async fn call(
        &self,
        cx: &mut ServerContext,
        req: Request<String>,
    ) -> Result<Self::Response, Self::Error> {
        let (metadata, message) = req.into_parts();
        let seen = Seen {
            metadata,
            request_id: cx.request_id().cloned(),
            segment: cx.segment().cloned(),
        };
        self.respond(seen, message)
    }
}

impl Service<ClientContext, Request<String>> for MockHandler {
    type Response = Response<String>;
    type Error = Status;

    async fn call(
        &self,
        cx: &mut ClientContext,
        req: Request<String>,
    ) -> Result<Self::Response, Self::Error> {
        let (metadata, message) = req.into_parts();
        let seen = Seen {
            metadata,
            request_id: None,
            segment: cx.segment().cloned(),
        };
        self.respond(seen, message)
    }
}

/// A streaming handler that yields `items` one by one.
#[derive(Clone)]
pub struct MockStreamHandler {
    items: Vec<Result<String, Status>>,
}

impl MockStreamHandler {
    pub fn new(items: Vec<Result<String, Status>>) -> Self {
        Self { items }
    }
}

impl Service<ServerContext, Request<String>> for MockStreamHandler {
    type Response = Response<BoxStream<'static, Result<String, Status>>>;
    type Error = Status;

    async fn call(
        &self,
        _cx: &mut ServerContext,
        _req: Request<String>,
    ) -> Result<Self::Response, Self::Error> {
        let items: BoxStream<'static, Result<String, Status>> =
            Box::pin(stream::iter(self.items.clone()));
        Ok(Response::new(items))
    }
}

impl Service<ClientContext, Request<String>> for MockStreamHandler {
    type Response = Response<BoxStream<'static, Result<String, Status>>>;
    type Error = Status;

    async fn call(
        &self,
        _cx: &mut ClientContext,
        _req: Request<String>,
    ) -> Result<Self::Response, Self::Error> {
        let items: BoxStream<'static, Result<String, Status>> =
            Box::pin(stream::iter(self.items.clone()));
        Ok(Response::new(items))
    }
}
