mod authority;
mod error;
mod leaf_cache;

pub use authority::{CaConfig, CertificateAuthority, CertificateRecord};
pub use error::CaError;
