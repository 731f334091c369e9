//! The listener and replication state (C6): owns the shared store, the
//! tagged primary/replica role, and the accept loop that hands each
//! connection off to `connection::run`.
use std::net::SocketAddrV4;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use log::{error, info};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, Notify};

use crate::config::Config;
use crate::connection;
use crate::rdb;
use crate::replica;
use crate::store::Store;
use crate::utils::random_id;

/// A primary's view of one attached replica: the socket half it writes
/// propagated commands to, and the last offset that replica has ACKed.
pub struct ReplicaHandle {
    pub addr: std::net::SocketAddr,
    pub write_half: Mutex<OwnedWriteHalf>,
    pub reported_offset: AtomicU64,
}

/// State that only exists when this process is the write master.
pub struct PrimaryState {
    pub replid: String,
    pub offset: AtomicU64,
    pub replicas: Mutex<Vec<Arc<ReplicaHandle>>>,
    pub propagate: broadcast::Sender<Vec<u8>>,
    pub ack_notify: Notify,
}

impl PrimaryState {
    fn new() -> Self {
        let (propagate, _) = broadcast::channel(1024);
        Self {
            replid: random_id(40),
            offset: AtomicU64::new(0),
            replicas: Mutex::new(Vec::new()),
            propagate,
            ack_notify: Notify::new(),
        }
    }
}

/// State that only exists when this process replicates from another primary.
pub struct ReplicaState {
    pub primary_host: String,
    pub primary_port: u16,
    pub offset: AtomicU64,
}

pub enum Role {
    Primary(PrimaryState),
    Replica(ReplicaState),
}

impl Role {
    pub fn is_replica(&self) -> bool {
        matches!(self, Role::Replica(_))
    }
}

/// Everything a connection or the replication engine needs to act on this
/// server instance. Cheap to share: held behind one `Arc`.
pub struct Shared {
    pub config: Config,
    pub store: Store,
    pub role: Role,
    pub stream_notify: Notify,
}

pub struct Server {
    config: Config,
    address: SocketAddrV4,
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let address = SocketAddrV4::new([0, 0, 0, 0].into(), config.port);
        let role = match config.replica_of() {
            Some((host, port)) => Role::Replica(ReplicaState {
                primary_host: host,
                primary_port: port,
                offset: AtomicU64::new(0),
            }),
            None => Role::Primary(PrimaryState::new()),
        };
        let shared = Arc::new(Shared {
            config: config.clone(),
            store: Store::new(),
            role,
            stream_notify: Notify::new(),
        });
        Self { config, address, shared }
    }

    /// Load the on-disk snapshot (if configured) and, if this process is a
    /// replica, start the outbound handshake with its primary. A configured
    /// snapshot that fails to load is a fatal startup error (spec §6: "nonzero
    /// on bind failure or malformed snapshot"); an unconfigured one is not.
    pub async fn initialize(&self) -> Result<(), rdb::RdbError> {
        match rdb::load(&self.config).await {
            Ok(entries) => {
                let rows = rdb::entries_into_store_rows(entries);
                let loaded = rows.len();
                self.shared.store.load_from(rows).await;
                info!("loaded {loaded} keys from snapshot");
            }
            Err(rdb::RdbError::NotConfigured) => {}
            Err(err) => return Err(err),
        }

        if let Role::Replica(state) = &self.shared.role {
            let shared = self.shared.clone();
            let host = state.primary_host.clone();
            let port = state.primary_port;
            let listening_port = self.config.port;
            tokio::spawn(async move {
                if let Err(err) = replica::run(shared, host, port, listening_port).await {
                    error!("replication link failed: {err}");
                }
            });
        }
        Ok(())
    }

    pub async fn start(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        info!("listening on port {}", self.config.port);
        loop {
            let (stream, addr) = listener.accept().await?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(err) = connection::run(shared, stream, addr).await {
                    error!("connection {addr} ended with error: {err}");
                }
            });
        }
    }
}

/// Register a freshly-promoted replica socket with the primary and spawn
/// its dedicated propagate/ACK-reading task.
pub async fn register_replica(
    shared: Arc<Shared>,
    addr: std::net::SocketAddr,
    write_half: OwnedWriteHalf,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
) {
    let Role::Primary(primary) = &shared.role else { return };
    let handle = Arc::new(ReplicaHandle {
        addr,
        write_half: Mutex::new(write_half),
        reported_offset: AtomicU64::new(0),
    });
    primary.replicas.lock().await.push(handle.clone());

    let mut rx = primary.propagate.subscribe();
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = bytes::BytesMut::with_capacity(4096);
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Ok(bytes) => {
                            let mut w = handle.write_half.lock().await;
                            if w.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                read_result = read_half.read_buf(&mut buf) => {
                    match read_result {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            while let Ok((frame, consumed)) = crate::resp::decode_one(&buf) {
                                if let Some(offset) = parse_replconf_ack(&frame) {
                                    handle.reported_offset.store(offset, std::sync::atomic::Ordering::SeqCst);
                                    if let Role::Primary(primary) = &shared.role {
                                        primary.ack_notify.notify_waiters();
                                    }
                                }
                                let _ = buf.split_to(consumed);
                            }
                        }
                    }
                }
            }
        }
    });
}

fn parse_replconf_ack(frame: &crate::resp::Frame) -> Option<u64> {
    let crate::resp::Frame::Array(items) = frame else { return None };
    let name = items.first()?.as_bulk_str()?;
    if !name.eq_ignore_ascii_case("REPLCONF") {
        return None;
    }
    let sub = items.get(1)?.as_bulk_str()?;
    if !sub.eq_ignore_ascii_case("ACK") {
        return None;
    }
    items.get(2)?.as_bulk_str()?.parse().ok()
}
