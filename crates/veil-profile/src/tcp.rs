use crate::error::ProfileError;
use crate::identity::OsIdentity;

/// IP TTL and initial TCP window size to apply to outbound sockets so the
/// packet-level fingerprint matches the emulated operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpStackSettings {
    pub ttl: u32,
    pub window_size: u32,
}

/// Pure lookup from OS identity to TCP stack parameters.
///
/// An unknown identity is a configuration error surfaced at session start:
/// falling back to the host's defaults would reintroduce exactly the
/// fingerprint mismatch this table exists to prevent.
pub fn tcp_settings_for_os(os: &OsIdentity) -> Result<TcpStackSettings, ProfileError> {
    let name = os.name.to_ascii_lowercase();
    let major = os
        .version
        .split(['.', '-'])
        .next()
        .unwrap_or_default()
        .to_string();

    if name.contains("windows") {
        let window_size = match major.as_str() {
            "7" | "8" => 8_192,
            "10" | "11" => 64_240,
            _ => return Err(ProfileError::UnknownOsProfile(os.to_string())),
        };
        return Ok(TcpStackSettings {
            ttl: 128,
            window_size,
        });
    }

    if name.contains("mac") || name.contains("ios") {
        return Ok(TcpStackSettings {
            ttl: 64,
            window_size: 65_535,
        });
    }

    if name.contains("linux") {
        return Ok(TcpStackSettings {
            ttl: 64,
            window_size: 5_840,
        });
    }

    Err(ProfileError::UnknownOsProfile(os.to_string()))
}
