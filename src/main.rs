use anyhow::Context;
use clap::Parser;

use crate::config::Config;
use crate::server::Server;

mod command;
mod config;
mod connection;
mod data;
mod engine;
mod rdb;
mod replica;
mod resp;
mod server;
mod store;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();
    let server = Server::new(config.clone());
    server.initialize().await.context("failed to load configured snapshot")?;
    server
        .start()
        .await
        .with_context(|| format!("server failed to listen on port {}", config.port))
}
