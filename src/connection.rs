//! One accepted socket's read/dispatch/reply loop (C6). `PSYNC` is special
//! cased here because promoting a connection to a replica link requires
//! taking ownership of the raw `TcpStream` halves — it can't flow through
//! the generic command-dispatch path.
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use log::{info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::command::Command;
use crate::engine;
use crate::rdb;
use crate::resp::{self, DecodeError, Frame};
use crate::server::{self, Role, Shared};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error")]
    Io(#[from] std::io::Error),
}

pub async fn run(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) -> Result<(), ConnectionError> {
    info!("accepted connection from {addr}");
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match resp::decode_one(&buf) {
            Ok((frame, consumed)) => {
                let raw = buf.split_to(consumed);
                match Command::parse(&frame) {
                    Ok(Command::Psync) => {
                        handle_psync(&shared, stream, addr).await?;
                        return Ok(());
                    }
                    Ok(cmd) => {
                        let reply = engine::dispatch(&shared, &cmd).await;
                        if cmd.is_write() && !matches!(reply, Frame::Error(_)) {
                            if let Role::Primary(primary) = &shared.role {
                                primary.offset.fetch_add(raw.len() as u64, Ordering::SeqCst);
                                let _ = primary.propagate.send(raw.to_vec());
                            }
                        }
                        stream.write_all(&resp::encode(&reply)).await?;
                    }
                    Err(err) => {
                        stream.write_all(&resp::encode(&Frame::error(err.to_string()))).await?;
                    }
                }
            }
            Err(DecodeError::Incomplete) => {
                let n = stream.read_buf(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
            }
            Err(err) => {
                warn!("protocol error from {addr}: {err}");
                let _ = stream
                    .write_all(&resp::encode(&Frame::error(format!("ERR Protocol error: {err}"))))
                    .await;
                return Ok(());
            }
        }
    }
}

/// Answer `PSYNC` with `FULLRESYNC` + a snapshot payload, then hand the
/// split socket off to the replica registry. A replica instance should
/// never receive this; it replies with an error and the connection is
/// then dropped by the caller.
async fn handle_psync(shared: &Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) -> Result<(), ConnectionError> {
    let Role::Primary(primary) = &shared.role else {
        stream
            .write_all(&resp::encode(&Frame::error("ERR PSYNC is not allowed on a replica")))
            .await?;
        return Ok(());
    };
    let offset = primary.offset.load(Ordering::SeqCst);
    let fullresync = resp::encode(&Frame::simple(format!("FULLRESYNC {} {offset}", primary.replid)));
    let rdb_payload = resp::encode_rdb_payload(rdb::EMPTY_RDB);

    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(&fullresync).await?;
    write_half.write_all(&rdb_payload).await?;

    server::register_replica(shared.clone(), addr, write_half, read_half).await;
    Ok(())
}
