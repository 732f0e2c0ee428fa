mod catalog;
mod error;
mod grease;
mod http2;
mod identity;
mod tcp;
mod tls;

pub use catalog::builtin_profile;
pub use error::ProfileError;
pub use grease::{is_grease, GreasePolicy, NoGrease, SeededGrease, GREASE_VALUES};
pub use http2::{session_preface, Http2Setting, Http2SessionPreface, Http2SettingsProfile};
pub use identity::{BrowserIdentity, EmulationProfile, OsIdentity};
pub use tcp::{tcp_settings_for_os, TcpStackSettings};
pub use tls::{client_hello_spec, ClientHelloSpec, TlsClientHelloProfile, TlsVersion};
