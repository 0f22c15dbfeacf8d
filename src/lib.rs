//! secio - Secure I/O session layer
//!
//! This crate provides a uniform, socket-like TLS session API implemented
//! against several host TLS facilities (OpenSSL, rustls and the platform
//! native stack), plus mock and no-TLS backends for testing.

pub mod sio;
