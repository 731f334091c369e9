use clap::Parser;

/// Process startup configuration. Parsed once in `main` and shared read-only
/// via `Arc` with every connection and the replication engine.
#[derive(Debug, Parser, Clone)]
#[command(name = "kvreplica", about = "in-memory key/value server with replication")]
pub struct Config {
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// "<host> <port>" of the primary to replicate from. Absent means this process is a primary.
    #[arg(long)]
    pub replicaof: Option<String>,

    #[arg(long)]
    pub dir: Option<String>,

    #[arg(long)]
    pub dbfilename: Option<String>,
}

impl Config {
    pub fn replica_of(&self) -> Option<(String, u16)> {
        let (host, port) = self.replicaof.as_ref()?.split_once(' ')?;
        let port: u16 = port.trim().parse().ok()?;
        Some((host.trim().to_string(), port))
    }

    /// `Some(value)` for a recognised key (`value` is `""` if unset),
    /// `None` if `key` isn't one `CONFIG GET` recognises at all.
    pub fn config_get(&self, key: &str) -> Option<String> {
        match key {
            "dir" => Some(self.dir.clone().unwrap_or_default()),
            "dbfilename" => Some(self.dbfilename.clone().unwrap_or_default()),
            _ => None,
        }
    }
}
