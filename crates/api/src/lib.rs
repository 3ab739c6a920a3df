//! Ingress and admin HTTP surface of the notification relay.

pub mod middleware;
pub mod routes;
pub mod state;
