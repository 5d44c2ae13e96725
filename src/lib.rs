pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod groth16;
pub mod keys;
pub mod manager;
pub mod routes;
pub mod session;
pub mod transport;
pub mod types;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;
