//! Difficulty arithmetic: compact `bits` targets and per-header work.

use primitive_types::U256;

use crate::chain_error::{ChainError, ChainResult};
use crate::types::Hash256;

/// Expand compact `bits` into the 256-bit target.
pub fn compact_to_target(bits: u32) -> ChainResult<U256> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;

    // Sign bit set on a non-zero mantissa means a negative target
    if bits & 0x0080_0000 != 0 && mantissa != 0 {
        return Err(ChainError::InvalidBits(bits));
    }

    let target = if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        let overflows = mantissa != 0
            && (exponent > 34
                || (mantissa > 0xff && exponent > 33)
                || (mantissa > 0xffff && exponent > 32));
        if overflows {
            return Err(ChainError::InvalidBits(bits));
        }
        U256::from(mantissa) << (8 * (exponent - 3))
    };

    if target.is_zero() {
        return Err(ChainError::InvalidBits(bits));
    }
    Ok(target)
}

/// Expected number of hashes to find a header at this target:
/// 2^256 / (target + 1), computed without overflowing 256 bits.
pub fn header_work(bits: u32) -> ChainResult<U256> {
    let target = compact_to_target(bits)?;
    let divisor = target
        .checked_add(U256::one())
        .ok_or(ChainError::InvalidBits(bits))?;
    Ok((!target / divisor) + U256::one())
}

/// Header hash, read as a little-endian number, must not exceed the target.
pub fn check_proof_of_work(hash: &Hash256, bits: u32) -> ChainResult<bool> {
    let target = compact_to_target(bits)?;
    Ok(U256::from_little_endian(hash) <= target)
}

/// Big-endian bytes of a U256 (limbs are stored least-significant first).
pub fn u256_to_be_bytes(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, limb) in value.0.iter().enumerate() {
        let start = 32 - (i + 1) * 8;
        out[start..start + 8].copy_from_slice(&limb.to_be_bytes());
    }
    out
}
