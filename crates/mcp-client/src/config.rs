//! Server descriptors, re-exported from `tm-domain`.
//!
//! The definitions live in `tm_domain::config` so config loaders can parse
//! and validate them without depending on the client crate.

pub use tm_domain::config::{
    DuplicatePolicy, HealthConfig, McpConfig, McpServerConfig, McpTransportKind, ReconnectConfig,
};
