use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("no tcp stack entry for operating system '{0}'")]
    UnknownOsProfile(String),
    #[error("no emulation profile for browser '{0}'")]
    UnknownBrowserProfile(String),
}
