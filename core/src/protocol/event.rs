//! Device-Event notification decoding.

/// Source byte of a refresh report
const SOURCE_REFRESH: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Alarm raised or cleared
    Alarm(bool),
    /// The panel finished redrawing a 1-based page
    Refresh { success: bool, page: u16 },
}

impl DeviceEvent {
    /// Decode a notification; `None` for anything unrecognised
    pub fn parse(value: &[u8]) -> Option<Self> {
        match value {
            [0x01, 0x00, ..] => Some(DeviceEvent::Alarm(false)),
            [0x01, 0x01, ..] => Some(DeviceEvent::Alarm(true)),
            [0x02, src, result, page, ..] if *src == SOURCE_REFRESH => Some(DeviceEvent::Refresh {
                success: *result == 0,
                page: *page as u16 + 1,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm() {
        assert_eq!(DeviceEvent::parse(&[0x01, 0x01]), Some(DeviceEvent::Alarm(true)));
        assert_eq!(DeviceEvent::parse(&[0x01, 0x00]), Some(DeviceEvent::Alarm(false)));
        assert_eq!(DeviceEvent::parse(&[0x01, 0x05]), None);
    }

    #[test]
    fn test_refresh() {
        assert_eq!(
            DeviceEvent::parse(&[0x02, 0x02, 0x00, 0x00]),
            Some(DeviceEvent::Refresh { success: true, page: 1 })
        );
        assert_eq!(
            DeviceEvent::parse(&[0x02, 0x02, 0x01, 0x03]),
            Some(DeviceEvent::Refresh { success: false, page: 4 })
        );
        assert_eq!(
            DeviceEvent::parse(&[0x02, 0x02, 0x00, 0xFF]),
            Some(DeviceEvent::Refresh { success: true, page: 256 })
        );
    }

    #[test]
    fn test_unrecognised() {
        assert_eq!(DeviceEvent::parse(&[]), None);
        assert_eq!(DeviceEvent::parse(&[0x01]), None);
        assert_eq!(DeviceEvent::parse(&[0x02, 0x01, 0x00, 0x00]), None);
        assert_eq!(DeviceEvent::parse(&[0x02, 0x02, 0x00]), None);
        assert_eq!(DeviceEvent::parse(&[0x09, 0x00]), None);
    }
}
