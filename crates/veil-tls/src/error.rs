use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
