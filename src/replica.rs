//! Outbound replication (C6): the link this process maintains to its
//! primary when started with `--replicaof`.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use log::{info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::command::Command;
use crate::engine;
use crate::resp::{self, DecodeError, Frame};
use crate::server::{Role, Shared};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("protocol error during handshake")]
    Protocol(#[from] DecodeError),

    #[error("primary rejected the handshake: {0}")]
    Rejected(String),
}

/// Run the handshake against `host:port` and then replay whatever it
/// sends forever. `listening_port` is this process's own accept port,
/// reported to the primary via `REPLCONF listening-port`.
pub async fn run(shared: Arc<Shared>, host: String, port: u16, listening_port: u16) -> Result<(), ReplicaError> {
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;
    let mut buf = BytesMut::with_capacity(4096);

    handshake_step(&mut stream, &mut buf, &Frame::Array(vec![Frame::bulk("PING")])).await?;
    handshake_step(
        &mut stream,
        &mut buf,
        &Frame::Array(vec![
            Frame::bulk("REPLCONF"),
            Frame::bulk("listening-port"),
            Frame::bulk(listening_port.to_string()),
        ]),
    )
    .await?;
    handshake_step(
        &mut stream,
        &mut buf,
        &Frame::Array(vec![Frame::bulk("REPLCONF"), Frame::bulk("capa"), Frame::bulk("psync2")]),
    )
    .await?;

    let psync = Frame::Array(vec![Frame::bulk("PSYNC"), Frame::bulk("?"), Frame::bulk("-1")]);
    stream.write_all(&resp::encode(&psync)).await?;
    let _fullresync = read_frame(&mut stream, &mut buf).await?;

    skip_rdb_payload(&mut stream, &mut buf).await?;

    info!("replica link to {host}:{port} established");
    apply_loop(&shared, stream, buf).await
}

async fn handshake_step(stream: &mut TcpStream, buf: &mut BytesMut, request: &Frame) -> Result<Frame, ReplicaError> {
    stream.write_all(&resp::encode(request)).await?;
    read_frame(stream, buf).await
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Frame, ReplicaError> {
    loop {
        match resp::decode_one(buf) {
            Ok((frame, consumed)) => {
                let _ = buf.split_to(consumed);
                return Ok(frame);
            }
            Err(DecodeError::Incomplete) => {
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Err(ReplicaError::Rejected("connection closed during handshake".into()));
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn skip_rdb_payload(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<(), ReplicaError> {
    loop {
        match resp::decode_rdb_payload(buf) {
            Ok((_payload, consumed)) => {
                let _ = buf.split_to(consumed);
                return Ok(());
            }
            Err(DecodeError::Incomplete) => {
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Err(ReplicaError::Rejected("connection closed while reading snapshot".into()));
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Replay commands forwarded by the primary. Offset advances by each
/// command's raw byte length before it is applied, so a `REPLCONF GETACK`
/// that arrives mid-stream is answered with an offset that already
/// accounts for its own bytes.
async fn apply_loop(shared: &Shared, mut stream: TcpStream, mut buf: BytesMut) -> Result<(), ReplicaError> {
    let Role::Replica(state) = &shared.role else {
        return Ok(());
    };
    loop {
        match resp::decode_one(&buf) {
            Ok((frame, consumed)) => {
                let raw = buf.split_to(consumed);
                state.offset.fetch_add(raw.len() as u64, Ordering::SeqCst);
                match Command::parse(&frame) {
                    Ok(Command::ReplConf { args }) if is_getack(&args) => {
                        let offset = state.offset.load(Ordering::SeqCst);
                        let ack = Frame::Array(vec![
                            Frame::bulk("REPLCONF"),
                            Frame::bulk("ACK"),
                            Frame::bulk(offset.to_string()),
                        ]);
                        stream.write_all(&resp::encode(&ack)).await?;
                    }
                    Ok(cmd) => engine::apply_propagated(shared, &cmd).await,
                    Err(err) => warn!("ignoring unparsable replicated command: {err}"),
                }
            }
            Err(DecodeError::Incomplete) => {
                let n = stream.read_buf(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_getack(args: &[String]) -> bool {
    args.first().map(|a| a.eq_ignore_ascii_case("GETACK")).unwrap_or(false)
}
