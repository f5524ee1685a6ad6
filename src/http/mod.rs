// src/http/mod.rs

//! HTTP support: request framing, the servlet boundary, response helpers and
//! the built-in metrics servlet.

pub mod metrics_servlet;
pub mod response;
pub mod servlet;
pub mod session;
pub mod url;

pub use metrics_servlet::MetricsServlet;
pub use response::ContentType;
pub use servlet::{HttpRequest, Servlet, ServletRegistry};
pub use session::HttpSession;
