//! `tm-domain`: shared configuration, error and trace types for toolmesh.
//!
//! Kept free of the client machinery so that config loaders and the CLI can
//! depend on it without pulling in transports.

pub mod config;
pub mod error;
pub mod trace;
