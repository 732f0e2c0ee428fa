use thiserror::Error;

#[derive(Debug, Error)]
pub enum VeilError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind proxy port after {attempts} attempts: {detail}")]
    Bind { attempts: u32, detail: String },
    #[error(transparent)]
    Profile(#[from] veil_profile::ProfileError),
    #[error("certificate authority error: {0}")]
    Ca(#[from] veil_tls::CaError),
    #[error("unknown session '{0}'")]
    UnknownSession(String),
    #[error("session '{0}' is already registered")]
    DuplicateSession(String),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
