//! Command execution (C5, execution half): turns a parsed `Command` into
//! store mutations and a reply frame. `PSYNC` is handled separately in
//! `connection.rs`, since it takes ownership of the raw socket instead of
//! producing a reply.
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::command::Command;
use crate::data::stream::EntryId;
use crate::data::Value;
use crate::resp::Frame;
use crate::server::{Role, Shared};
use crate::utils::now_ms;

/// Execute any non-PSYNC command and produce its reply. Applies the
/// replica write-guard: a normal client talking to a replica is refused
/// on `SET`/`XADD`, matching the read-only-replica behavior the rest of
/// the ecosystem expects.
pub async fn dispatch(shared: &Shared, cmd: &Command) -> Frame {
    if cmd.is_write() && shared.role.is_replica() {
        return Frame::error("READONLY You can't write against a read only replica.");
    }
    execute(shared, cmd).await
}

/// Execute a command's store-mutating effect without the replica guard —
/// used to apply commands replayed from a primary's replication stream.
pub async fn apply_propagated(shared: &Shared, cmd: &Command) {
    execute(shared, cmd).await;
}

async fn execute(shared: &Shared, cmd: &Command) -> Frame {
    match cmd {
        Command::Ping => Frame::simple("PONG"),
        Command::Echo(msg) => Frame::Bulk(msg.clone()),
        Command::Set { key, value, px } => {
            let expires_at_ms = px.map(|ms| now_ms() + ms.max(0) as u64);
            shared.store.set(key.clone(), Value::Str(value.clone()), expires_at_ms).await;
            Frame::simple("OK")
        }
        Command::Get { key } => match shared.store.get(key).await {
            Some(Value::Str(v)) => Frame::Bulk(v),
            Some(Value::Stream(_)) => {
                Frame::error("WRONGTYPE Operation against a key holding the wrong kind of value")
            }
            None => Frame::Null,
        },
        Command::Type { key } => Frame::simple(shared.store.type_of(key).await),
        Command::Keys { pattern } => {
            let keys = shared.store.keys().await;
            let matched: Vec<Frame> = keys
                .into_iter()
                .filter(|k| glob_match(pattern, k))
                .map(Frame::bulk)
                .collect();
            Frame::Array(matched)
        }
        Command::XAdd { key, id_spec, fields } => {
            let result = shared
                .store
                .with_stream_mut(key, |stream| stream.xadd(id_spec, fields.clone()))
                .await;
            match result {
                Ok(id) => {
                    shared.stream_notify.notify_waiters();
                    Frame::bulk(id.to_string())
                }
                Err(err) => Frame::error(err.to_string()),
            }
        }
        Command::XRange { key, start, end } => {
            let result = shared.store.stream_read(key, |stream| stream.xrange(start, end)).await;
            match result {
                Ok(Some(Ok(entries))) => Frame::Array(entries.into_iter().map(encode_entry).collect()),
                Ok(Some(Err(err))) => Frame::error(err.to_string()),
                Ok(None) => Frame::Array(Vec::new()),
                Err(err) => Frame::error(err.to_string()),
            }
        }
        Command::XRead { block_ms, pairs } => xread(shared, *block_ms, pairs).await,
        Command::Info { section } => info(shared, section.as_deref()),
        Command::ConfigGet { key } => match shared.config.config_get(key) {
            Some(value) => Frame::Array(vec![Frame::bulk(key.clone()), Frame::bulk(value)]),
            None => Frame::error(crate::command::CommandError::UnknownConfigKey(key.clone()).to_string()),
        },
        Command::ReplConf { .. } => Frame::simple("OK"),
        Command::Psync => Frame::error("ERR PSYNC must be handled by the connection loop"),
        Command::Wait { numreplicas, timeout_ms } => wait(shared, *numreplicas, *timeout_ms).await,
        Command::Select { .. } => Frame::simple("OK"),
    }
}

async fn xread(shared: &Shared, block_ms: Option<i64>, pairs: &[(String, String)]) -> Frame {
    let watermarks = match resolve_watermarks(shared, pairs).await {
        Ok(watermarks) => watermarks,
        Err(err) => return Frame::error(err),
    };

    let read_once = |watermarks: &[(String, Option<EntryId>)]| async {
        let mut per_stream = Vec::new();
        for (key, after) in watermarks {
            let entries = shared.store.stream_entries_after(key, *after).await;
            if !entries.is_empty() {
                per_stream.push((key.clone(), entries));
            }
        }
        per_stream
    };

    // Register with the notifier before the state check it guards: `enable()`
    // puts this waiter on Notify's list without consuming it, so an XADD's
    // `notify_waiters()` landing between here and the read below still wakes
    // it, instead of being lost the way a bare `.notified().await` after the
    // read would lose it.
    let notified = shared.stream_notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    let mut results = read_once(&watermarks).await;
    if !results.is_empty() || block_ms.is_none() {
        return render_xread(std::mem::take(&mut results));
    }

    let block_ms = block_ms.unwrap();
    if block_ms == 0 {
        loop {
            notified.as_mut().await;
            notified.set(shared.stream_notify.notified());
            notified.as_mut().enable();
            results = read_once(&watermarks).await;
            if !results.is_empty() {
                return render_xread(results);
            }
        }
    }

    let deadline = tokio::time::sleep(Duration::from_millis(block_ms as u64));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut notified => {
                notified.set(shared.stream_notify.notified());
                notified.as_mut().enable();
                results = read_once(&watermarks).await;
                if !results.is_empty() {
                    return render_xread(results);
                }
            }
            _ = &mut deadline => return Frame::Null,
        }
    }
}

/// Resolve each pair's starting id once, up front: `$` snapshots the
/// stream's current last id at call time so a blocking read only sees
/// entries appended after the call started. A malformed explicit id is a
/// command usage error, not a silent "read everything" fallback.
async fn resolve_watermarks(
    shared: &Shared,
    pairs: &[(String, String)],
) -> Result<Vec<(String, Option<EntryId>)>, String> {
    let mut out = Vec::with_capacity(pairs.len());
    for (key, id) in pairs {
        let watermark = if id == "$" {
            Some(shared.store.stream_last_id(key).await)
        } else {
            match crate::data::stream::parse_exact(id) {
                Ok(id) => Some(id),
                Err(_) => {
                    return Err("ERR Invalid stream ID specified as stream command argument".to_string())
                }
            }
        };
        out.push((key.clone(), watermark));
    }
    Ok(out)
}

fn render_xread(per_stream: Vec<(String, Vec<(EntryId, Vec<(String, Vec<u8>)>)>)>) -> Frame {
    if per_stream.is_empty() {
        return Frame::Null;
    }
    Frame::Array(
        per_stream
            .into_iter()
            .map(|(key, entries)| {
                Frame::Array(vec![
                    Frame::bulk(key),
                    Frame::Array(entries.into_iter().map(encode_entry).collect()),
                ])
            })
            .collect(),
    )
}

fn encode_entry((id, fields): (EntryId, Vec<(String, Vec<u8>)>)) -> Frame {
    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (k, v) in fields {
        flat.push(Frame::bulk(k));
        flat.push(Frame::Bulk(v));
    }
    Frame::Array(vec![Frame::bulk(id.to_string()), Frame::Array(flat)])
}

fn info(shared: &Shared, section: Option<&str>) -> Frame {
    if let Some(section) = section {
        if !section.eq_ignore_ascii_case("replication") {
            return Frame::bulk("");
        }
    }
    let body = match &shared.role {
        Role::Primary(p) => format!(
            "# Replication\r\nrole:master\r\nmaster_replid:{}\r\nmaster_repl_offset:{}\r\nconnected_slaves:{}\r\n",
            p.replid,
            p.offset.load(Ordering::SeqCst),
            p.replicas.try_lock().map(|r| r.len()).unwrap_or(0),
        ),
        Role::Replica(r) => format!(
            "# Replication\r\nrole:slave\r\nmaster_host:{}\r\nmaster_port:{}\r\nmaster_repl_offset:{}\r\n",
            r.primary_host,
            r.primary_port,
            r.offset.load(Ordering::SeqCst),
        ),
    };
    Frame::bulk(body)
}

async fn wait(shared: &Shared, numreplicas: i64, timeout_ms: i64) -> Frame {
    let Role::Primary(p) = &shared.role else {
        return Frame::error("ERR WAIT is not allowed on a replica");
    };
    let target = p.offset.load(Ordering::SeqCst);
    let numreplicas = numreplicas.max(0) as usize;

    let count_synced = || async {
        p.replicas
            .lock()
            .await
            .iter()
            .filter(|r| r.reported_offset.load(Ordering::SeqCst) >= target)
            .count()
    };

    let mut synced = count_synced().await;
    if synced >= numreplicas {
        return Frame::Integer(synced as i64);
    }

    // GETACK is not a replicated write: it is forwarded to replicas but does
    // not advance the primary's own replication offset (spec §4.6).
    let getack = crate::resp::encode(&Frame::Array(vec![
        Frame::bulk("REPLCONF"),
        Frame::bulk("GETACK"),
        Frame::bulk("*"),
    ]));
    let _ = p.propagate.send(getack);

    let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms.max(0) as u64));
    tokio::pin!(deadline);
    loop {
        synced = count_synced().await;
        if synced >= numreplicas {
            break;
        }
        tokio::select! {
            _ = p.ack_notify.notified() => {}
            _ = &mut deadline => break,
        }
    }
    Frame::Integer(synced as i64)
}

/// Minimal glob: `*` matches any run of characters, `?` matches exactly one.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    fn inner(pattern: &[u8], candidate: &[u8]) -> bool {
        match (pattern.first(), candidate.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], candidate) || (!candidate.is_empty() && inner(pattern, &candidate[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &candidate[1..]),
            (Some(p), Some(c)) if p == c => inner(&pattern[1..], &candidate[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), candidate.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_everything() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("foo*", "foobar"));
        assert!(!glob_match("foo*", "barfoo"));
    }

    #[test]
    fn glob_question_mark_matches_one_char() {
        assert!(glob_match("f?o", "foo"));
        assert!(!glob_match("f?o", "fooo"));
    }
}
