// src/server/mod.rs

use crate::config::Config;
use crate::http::Servlet;
use anyhow::Result;
use std::sync::Arc;

mod connection_loop;
mod context;
mod initialization;
mod listener;
mod stream;

pub use connection_loop::serve_until;
pub use context::ServerContext;
pub use initialization::{build_server_config, setup};
pub use listener::{AnyListener, bind_all, bind_local, bind_tcp};
pub use stream::AnyStream;

/// The main server startup function: initialize, then serve until signalled.
pub async fn run(config: Config, servlets: Vec<Arc<dyn Servlet>>) -> Result<()> {
    let server_context = setup(config, servlets)?;
    connection_loop::run(server_context).await
}
