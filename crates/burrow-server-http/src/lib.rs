//! Public HTTP ingress
//!
//! Accepts public HTTP/1.1 requests, routes each one to a tunnel client and
//! streams the client's response back to the caller.

pub mod server;

pub use server::{HttpServer, HttpServerConfig, HttpServerError, PublicIngress};
