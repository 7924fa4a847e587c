//! Bit-packed values for fixed-length column pages.
//!
//! Entry `i` occupies bits `[i * bitcnt, (i + 1) * bitcnt)` of the body,
//! least significant bit first.

pub fn packed_len(entries: u64, bitcnt: u8) -> usize {
    (entries * bitcnt as u64).div_ceil(8) as usize
}

pub fn value_mask(bitcnt: u8) -> u8 {
    if bitcnt >= 8 {
        0xff
    } else {
        (1u8 << bitcnt) - 1
    }
}

pub fn get(bits: &[u8], index: u64, bitcnt: u8) -> u8 {
    let mut value = 0u8;
    let start = index * bitcnt as u64;
    for i in 0..bitcnt as u64 {
        let bit = start + i;
        if bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0 {
            value |= 1 << i;
        }
    }
    value
}

pub fn set(bits: &mut [u8], index: u64, bitcnt: u8, value: u8) {
    let start = index * bitcnt as u64;
    for i in 0..bitcnt as u64 {
        let bit = start + i;
        let byte = &mut bits[(bit / 8) as usize];
        if value & (1 << i) != 0 {
            *byte |= 1 << (bit % 8);
        } else {
            *byte &= !(1 << (bit % 8));
        }
    }
}

/// Pack a run of values into a new body.
pub fn pack(values: &[u8], bitcnt: u8) -> Vec<u8> {
    let mut bits = vec![0u8; packed_len(values.len() as u64, bitcnt)];
    let mask = value_mask(bitcnt);
    for (i, v) in values.iter().enumerate() {
        set(&mut bits, i as u64, bitcnt, v & mask);
    }
    bits
}
