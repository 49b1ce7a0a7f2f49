//! Advertisement payload parsing.

/// AD type of manufacturer-specific data
pub const AD_TYPE_MANUFACTURER: u8 = 0xFF;
/// Alarm flag value in the first manufacturer data byte
const ALARM_RAISED: u8 = 0x01;

/// One `[len][type][data...]` structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Split a raw advertisement into AD structures.
///
/// A zero length ends the payload; a truncated trailing structure is dropped.
pub fn parse_structures(payload: &[u8]) -> Vec<AdStructure<'_>> {
    let mut structures = Vec::new();
    let mut pos = 0;
    while let Some(&len) = payload.get(pos) {
        if len == 0 {
            break;
        }
        let end = pos + 1 + len as usize;
        let Some(body) = payload.get(pos + 1..end) else {
            break;
        };
        structures.push(AdStructure {
            ad_type: body[0],
            data: &body[1..],
        });
        pos = end;
    }
    structures
}

/// Data of the first manufacturer-specific structure
pub fn manufacturer_data(payload: &[u8]) -> Option<&[u8]> {
    parse_structures(payload)
        .into_iter()
        .find(|s| s.ad_type == AD_TYPE_MANUFACTURER)
        .map(|s| s.data)
}

/// Alarm flag carried in the manufacturer data
pub fn alarm_flag(payload: &[u8]) -> bool {
    manufacturer_data(payload)
        .and_then(|data| data.first())
        .is_some_and(|b| *b == ALARM_RAISED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structures() {
        let payload = [0x02, 0x01, 0x06, 0x03, 0xFF, 0x01, 0x02, 0x00, 0x00];
        let structures = parse_structures(&payload);
        assert_eq!(structures.len(), 2);
        assert_eq!(structures[0].ad_type, 0x01);
        assert_eq!(structures[1].data, &[0x01, 0x02]);
    }

    #[test]
    fn test_truncated_structure_dropped() {
        let payload = [0x02, 0x01, 0x06, 0x05, 0xFF, 0x01];
        assert_eq!(parse_structures(&payload).len(), 1);
    }

    #[test]
    fn test_alarm_flag() {
        assert!(alarm_flag(&[0x02, 0x01, 0x06, 0x02, 0xFF, 0x01]));
        assert!(!alarm_flag(&[0x02, 0xFF, 0x00]));
        assert!(!alarm_flag(&[0x02, 0x01, 0x06]));
        assert!(!alarm_flag(&[]));
    }

    #[test]
    fn test_only_first_manufacturer_structure_counts() {
        assert!(!alarm_flag(&[0x02, 0xFF, 0x00, 0x02, 0xFF, 0x01]));
    }
}
