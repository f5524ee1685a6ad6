// src/http/metrics_servlet.rs

//! Serves the proxy's own Prometheus metrics at `/metrics`.

use super::response::{self, ContentType};
use super::servlet::{HttpRequest, Servlet};
use crate::connection::Client;
use crate::core::errors::ProxyError;
use crate::core::metrics;
use bytes::Bytes;

pub const METRICS_PATH: &str = "/metrics";

#[derive(Debug, Default)]
pub struct MetricsServlet;

impl Servlet for MetricsServlet {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_url(&self, _client: &Client, request: &mut HttpRequest) -> bool {
        request.path == METRICS_PATH
    }

    fn on_done(&self, client: &Client, request: &mut HttpRequest) -> Result<(), ProxyError> {
        match request.method.as_str() {
            "GET" => {
                let body = Bytes::from(metrics::gather_metrics());
                response::reply(client, request, 200, ContentType::Prometheus, body)
            }
            "HEAD" => {
                let length = metrics::gather_metrics().len();
                response::reply_head(client, request, 200, ContentType::Prometheus, length)
            }
            _ => response::error(
                client,
                request,
                405,
                Some(self.name()),
                "only GET and HEAD are supported",
            ),
        }
    }
}
