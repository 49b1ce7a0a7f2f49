//! CRC16-CCITT (polynomial 0x1021, MSB-first, no reflection, no final XOR).

/// Generator polynomial
pub const POLYNOMIAL: u16 = 0x1021;

/// Initial register value used on the wire
pub const WIRE_INIT: u16 = 0x0000;

/// CRC of `data` with the initial value the devices expect
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16_ccitt_with_init(data, WIRE_INIT)
}

/// CRC of `data` starting from `init`.
///
/// `init = 0xFFFF` gives the CCITT-FALSE variant.
pub fn crc16_ccitt_with_init(data: &[u8], init: u16) -> u16 {
    let mut crc = init;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}
