// Auth Relay - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod interception;
pub mod middleware;
pub mod routes;
pub mod transport;

#[cfg(test)]
mod test_support;
