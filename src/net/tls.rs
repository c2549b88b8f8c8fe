//! TLS configuration and certificate loading for the listener.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

/// Load TLS configuration from PEM certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    for (what, path) in [("Certificate", cert_path), ("Private key", key_path)] {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{what} file not found: {}", path.display()),
            ));
        }
    }
    RustlsConfig::from_pem_file(cert_path, key_path).await
}
