//! CRC-16/MODBUS
//!
//! 参数：poly `0x8005`（反射后 `0xA001`），refin/refout，init `0xFFFF`，xorout `0`。

const POLY_REFLECTED: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u16; 256] = build_table();

/// 计算 CRC-16/MODBUS
pub fn crc16_modbus(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF_u16, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ byte as u16) & 0xFF) as usize]
    })
}
