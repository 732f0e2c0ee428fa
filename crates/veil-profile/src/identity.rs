use std::fmt;

use crate::error::ProfileError;
use crate::http2::Http2SettingsProfile;
use crate::tls::TlsClientHelloProfile;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrowserIdentity {
    pub name: String,
    pub version: String,
}

impl BrowserIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for BrowserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OsIdentity {
    pub name: String,
    pub version: String,
}

impl OsIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for OsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// One browser+OS combination with the concrete network-level parameter
/// sets to emulate. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulationProfile {
    pub browser: BrowserIdentity,
    pub os: OsIdentity,
    pub tls: TlsClientHelloProfile,
    pub http2: Http2SettingsProfile,
}

impl EmulationProfile {
    pub fn lookup(browser: &BrowserIdentity, os: &OsIdentity) -> Result<Self, ProfileError> {
        crate::catalog::builtin_profile(browser, os)
    }
}
