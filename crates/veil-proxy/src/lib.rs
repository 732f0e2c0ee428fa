mod config;
mod connect;
mod errors;
mod http2_relay;
mod interceptor;
mod matcher;
mod metrics;
mod registry;
mod relay;
mod tls_failure;
mod upstream;

pub use config::{MatcherConfig, ProxyConfig, UpstreamConfig};
pub use errors::VeilError;
pub use interceptor::InterceptorHandle;
pub use matcher::BrowserRequestMatcher;
pub use metrics::ProxyMetrics;
pub use registry::SessionProxyRegistry;
pub use tls_failure::{classify_tls_error, TlsFailureReason};

pub use veil_observe::{
    BrowserRequestDescriptor, FinalizedResource, JsonlResourceLog, NoopSink, ResourceFinalizedSink,
    ResourceState, SocketRecord, VecSink,
};
pub use veil_profile::{
    builtin_profile, BrowserIdentity, EmulationProfile, OsIdentity, ProfileError,
};
pub use veil_tls::{CaConfig, CaError, CertificateAuthority};
