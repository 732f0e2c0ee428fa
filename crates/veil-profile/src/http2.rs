/// HTTP/2 session parameters a browser advertises at connection start:
/// the SETTINGS frame payload, in the order the browser sends the entries,
/// plus the connection-level flow-control window it immediately announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2SettingsProfile {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_stream_window_size: u32,
    pub max_header_list_size: u32,
    pub initial_connection_window_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxHeaderListSize(u32),
}

impl Http2Setting {
    /// RFC 7540 §6.5.2 identifier.
    pub fn identifier(self) -> u16 {
        match self {
            Self::HeaderTableSize(_) => 0x1,
            Self::EnablePush(_) => 0x2,
            Self::MaxConcurrentStreams(_) => 0x3,
            Self::InitialWindowSize(_) => 0x4,
            Self::MaxHeaderListSize(_) => 0x6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2SessionPreface {
    pub settings: Vec<Http2Setting>,
    pub initial_connection_window_size: u32,
}

/// Pure function of the profile; no state.
pub fn session_preface(profile: &Http2SettingsProfile) -> Http2SessionPreface {
    Http2SessionPreface {
        settings: vec![
            Http2Setting::HeaderTableSize(profile.header_table_size),
            Http2Setting::EnablePush(profile.enable_push),
            Http2Setting::MaxConcurrentStreams(profile.max_concurrent_streams),
            Http2Setting::InitialWindowSize(profile.initial_stream_window_size),
            Http2Setting::MaxHeaderListSize(profile.max_header_list_size),
        ],
        initial_connection_window_size: profile.initial_connection_window_size,
    }
}

#[cfg(test)]
mod tests {
    use super::{session_preface, Http2Setting, Http2SettingsProfile};

    fn chrome_like() -> Http2SettingsProfile {
        Http2SettingsProfile {
            header_table_size: 65_536,
            enable_push: false,
            max_concurrent_streams: 1_000,
            initial_stream_window_size: 6_291_456,
            max_header_list_size: 262_144,
            initial_connection_window_size: 15_663_105,
        }
    }

    #[test]
    fn preface_preserves_setting_order_and_identifiers() {
        let preface = session_preface(&chrome_like());
        let identifiers: Vec<u16> = preface
            .settings
            .iter()
            .map(|setting| setting.identifier())
            .collect();
        assert_eq!(identifiers, vec![0x1, 0x2, 0x3, 0x4, 0x6]);
        assert_eq!(preface.initial_connection_window_size, 15_663_105);
    }

    #[test]
    fn preface_is_pure() {
        let profile = chrome_like();
        assert_eq!(session_preface(&profile), session_preface(&profile));
        assert!(preface_contains(
            &session_preface(&profile),
            Http2Setting::InitialWindowSize(6_291_456)
        ));
    }

    fn preface_contains(preface: &super::Http2SessionPreface, needle: Http2Setting) -> bool {
        preface.settings.iter().any(|setting| *setting == needle)
    }
}
