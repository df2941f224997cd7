//! Checksum primitives for Modbus framing
//!
//! Supports: CRC-16/Modbus (RTU frames) and LRC (ASCII frames)

/// CRC-16/Modbus
///
/// Polynomial: 0x8005 (reflected 0xA001), Init: 0xFFFF, RefIn: true, RefOut: true
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// LRC (Longitudinal Redundancy Check) used by Modbus ASCII
///
/// Sum of all bytes mod 256, then two's complement
pub fn lrc(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}
