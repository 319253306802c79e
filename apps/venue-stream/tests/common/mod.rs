//! Shared fixtures: a scriptable loopback venue and a counting credential
//! source.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use venue_stream::{CredentialError, CredentialSource};

/// Text frame received by the venue, tagged with the connection it came on.
#[derive(Debug, Clone)]
pub struct Received {
    /// Zero-based index among upgraded connections.
    pub connection: usize,
    /// Frame payload.
    pub text: String,
}

#[derive(Debug, Clone)]
enum Control {
    Send(String),
    Drop,
}

#[derive(Default)]
struct VenueState {
    accepts: AtomicUsize,
    upgrades: AtomicUsize,
    reject: AtomicUsize,
    stall: AtomicUsize,
    paths: Mutex<Vec<String>>,
}

/// Loopback WebSocket server standing in for the venue.
///
/// Every TCP connection counts as an accept. Rejected connections are closed
/// before the handshake, so the client sees a failed dial. Stalled connections
/// are held open without answering the upgrade, so the client's dial times out.
pub struct MockVenue {
    addr: SocketAddr,
    state: Arc<VenueState>,
    control: broadcast::Sender<Control>,
    received: mpsc::UnboundedReceiver<Received>,
}

impl MockVenue {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(VenueState::default());
        let (control, _) = broadcast::channel(64);
        let (received_tx, received) = mpsc::unbounded_channel();

        let server_state = Arc::clone(&state);
        let server_control = control.clone();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                server_state.accepts.fetch_add(1, Ordering::SeqCst);

                let rejected = server_state
                    .reject
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                        0 => None,
                        usize::MAX => Some(usize::MAX),
                        n => Some(n - 1),
                    })
                    .is_ok();
                if rejected {
                    drop(tcp);
                    continue;
                }

                let stalled = server_state
                    .stall
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if stalled {
                    tokio::spawn(async move {
                        let _held = tcp;
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    });
                    continue;
                }

                let state = Arc::clone(&server_state);
                let mut control_rx = server_control.subscribe();
                let received_tx = received_tx.clone();
                tokio::spawn(async move {
                    let paths = Arc::clone(&state);
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        paths.paths.lock().push(req.uri().path().to_owned());
                        Ok(resp)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                        return;
                    };
                    let connection = state.upgrades.fetch_add(1, Ordering::SeqCst);

                    loop {
                        tokio::select! {
                            frame = ws.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(Received {
                                        connection,
                                        text: text.to_string(),
                                    });
                                }
                                Some(Ok(_)) => {}
                                _ => return,
                            },
                            command = control_rx.recv() => match command {
                                Ok(Control::Send(text)) => {
                                    if ws.send(Message::Text(text.into())).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            state,
            control,
            received,
        }
    }

    /// `ws://` URL with the given path.
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    pub fn accepts(&self) -> usize {
        self.state.accepts.load(Ordering::SeqCst)
    }

    pub fn upgrades(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }

    /// Request paths of upgraded connections, in order.
    pub fn paths(&self) -> Vec<String> {
        self.state.paths.lock().clone()
    }

    /// Close the next `n` connections before the handshake.
    pub fn reject_next(&self, n: usize) {
        self.state.reject.store(n, Ordering::SeqCst);
    }

    /// Hold the next `n` connections open without answering the handshake.
    pub fn stall_next(&self, n: usize) {
        self.state.stall.store(n, Ordering::SeqCst);
    }

    /// Close every future connection before the handshake.
    pub fn reject_all(&self) {
        self.state.reject.store(usize::MAX, Ordering::SeqCst);
    }

    /// Send a text frame on every live connection.
    pub fn push(&self, text: &str) {
        let _ = self.control.send(Control::Send(text.to_owned()));
    }

    /// Abruptly close every live connection.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Next frame the client sent.
    pub async fn next_received(&mut self) -> Received {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("venue stopped")
    }

    /// Frames received so far that were not yet consumed.
    pub fn drain_received(&mut self) -> Vec<Received> {
        let mut out = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            out.push(frame);
        }
        out
    }

    pub async fn wait_for_upgrades(&self, n: usize) {
        wait_until(|| self.upgrades() >= n).await;
    }

    pub async fn wait_for_accepts(&self, n: usize) {
        wait_until(|| self.accepts() >= n).await;
    }
}

/// Poll `condition` every 10 ms for up to 5 s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Credential source handing out `key-1`, `key-2`, ... and counting calls.
#[derive(Default)]
pub struct CountingSource {
    issued: AtomicUsize,
    refreshed: AtomicUsize,
    failing_issues: AtomicUsize,
}

impl CountingSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` issue calls fail.
    pub fn fail_next_issues(&self, n: usize) {
        self.failing_issues.store(n, Ordering::SeqCst);
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn refreshed(&self) -> usize {
        self.refreshed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingSource {
    async fn issue(&self) -> Result<String, CredentialError> {
        if self
            .failing_issues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CredentialError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("key-{n}"))
    }

    async fn refresh(&self, _token: &str) -> Result<(), CredentialError> {
        self.refreshed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
