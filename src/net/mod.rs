//! Network layer subsystem.
//!
//! Plain TCP listeners are bound directly by the binary; this module only
//! covers the optional TLS termination in front of the proxy.

pub mod tls;
