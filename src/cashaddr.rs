//! CashAddr encoding.
//!
//! Bitcoin Cash addresses are bech32-like but use `:` as the separator,
//! an 8-character checksum, and a 40-bit polymod generator. The checksum
//! algorithm differs from BIP-173 enough that a generic bech32 codec
//! cannot produce it.

use crate::error::{WalletError, WalletResult};

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const GEN: [u64; 5] = [
    0x98f2bc8e61,
    0x79b76d99e2,
    0xf33e5fb3c4,
    0xae2eabe2a8,
    0x1e4f43e470,
];

/// What a CashAddr payload pays to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    PubkeyHash,
    ScriptHash,
}

fn polymod(values: &[u8]) -> u64 {
    let mut chk: u64 = 1;
    for &v in values {
        let b = chk >> 35;
        chk = (chk & 0x07ffffffff) << 5 ^ u64::from(v);
        for (i, gen) in GEN.iter().enumerate() {
            if b & (1 << i) != 0 {
                chk ^= gen;
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let mut v: Vec<u8> = hrp.bytes().map(|b| b & 31).collect();
    v.push(0);
    v
}

fn checksum(hrp: &str, data: &[u8]) -> [u8; 8] {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0; 8]);
    let polymod = polymod(&values) ^ 1;
    let mut res = [0u8; 8];
    for (i, b) in res.iter_mut().enumerate() {
        *b = ((polymod >> (5 * (7 - i))) & 31) as u8;
    }
    res
}

fn verify_checksum(hrp: &str, data: &[u8]) -> bool {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    polymod(&values) == 1
}

/// Regroups a bit stream from `from`-bit groups into `to`-bit groups.
pub fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> WalletResult<Vec<u8>> {
    if !(1..=8).contains(&from) || !(1..=8).contains(&to) {
        return Err(WalletError::Decode(
            "only bit groups between 1 and 8 allowed".to_string(),
        ));
    }

    let mut regrouped = Vec::new();
    let mut next_byte: u8 = 0;
    let mut filled_bits: u32 = 0;

    for &b in data {
        // Discard unused high bits.
        let mut b = b << (8 - from);
        let mut rem_from = from;
        while rem_from > 0 {
            let rem_to = to - filled_bits;
            let to_extract = rem_from.min(rem_to);

            next_byte = (next_byte << to_extract) | (b >> (8 - to_extract));
            b <<= to_extract;
            rem_from -= to_extract;
            filled_bits += to_extract;

            if filled_bits == to {
                regrouped.push(next_byte);
                filled_bits = 0;
                next_byte = 0;
            }
        }
    }

    if pad && filled_bits > 0 {
        next_byte <<= to - filled_bits;
        regrouped.push(next_byte);
        filled_bits = 0;
    }

    if filled_bits > 0 && (filled_bits > 4 || next_byte != 0) {
        return Err(WalletError::Decode("invalid incomplete bit group".to_string()));
    }

    Ok(regrouped)
}

/// Encodes 5-bit `data` groups under `hrp`, producing `hrp:payload`.
pub fn encode(hrp: &str, data: &[u8]) -> String {
    let mut combined = data.to_vec();
    combined.extend_from_slice(&checksum(hrp, data));

    let mut out = String::with_capacity(hrp.len() + 1 + combined.len());
    out.push_str(hrp);
    out.push(':');
    for b in combined {
        out.push(CHARSET[b as usize] as char);
    }
    out
}

/// Decodes a CashAddr string into its prefix and 5-bit payload, checksum
/// excluded. A string without a `:` is decoded against `default_hrp`,
/// which is how the stripped form callers see is read back.
pub fn decode(addr: &str, default_hrp: &str) -> WalletResult<(String, Vec<u8>)> {
    let invalid = || WalletError::InvalidAddress(addr.to_string());

    if addr.len() < 10 || addr.len() > 90 {
        return Err(invalid());
    }
    if addr.bytes().any(|b| !(33..=126).contains(&b)) {
        return Err(invalid());
    }
    let lower = addr.to_lowercase();
    if addr != lower && addr != addr.to_uppercase() {
        return Err(invalid());
    }
    let addr = lower;

    let (hrp, data) = match addr.rfind(':') {
        Some(one) => {
            if one < 1 || one + 9 > addr.len() {
                return Err(invalid());
            }
            (addr[..one].to_string(), &addr[one + 1..])
        }
        None => (default_hrp.to_string(), addr.as_str()),
    };

    let mut decoded = Vec::with_capacity(data.len());
    for c in data.bytes() {
        let index = CHARSET.iter().position(|&b| b == c).ok_or_else(invalid)?;
        decoded.push(index as u8);
    }

    if !verify_checksum(&hrp, &decoded) {
        return Err(invalid());
    }

    decoded.truncate(decoded.len() - 8);
    Ok((hrp, decoded))
}

/// Encodes a 20-byte hash as a CashAddr, returned without the prefix,
/// which is the form external callers see.
pub fn encode_payload(hrp: &str, kind: PayloadKind, hash: &[u8; 20]) -> String {
    let full = encode_payload_with_prefix(hrp, kind, hash);
    full[hrp.len() + 1..].to_string()
}

/// Encodes a 20-byte hash as a CashAddr with the full `hrp:` prefix.
pub fn encode_payload_with_prefix(hrp: &str, kind: PayloadKind, hash: &[u8; 20]) -> String {
    let version: u8 = match kind {
        PayloadKind::PubkeyHash => 0,
        PayloadKind::ScriptHash => 1 << 3,
    };
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);

    // 8-to-5 regrouping of a 21-byte payload cannot fail.
    let conv = convert_bits(&payload, 8, 5, true).expect("21-byte payload regroups");
    encode(hrp, &conv)
}

/// Decodes a CashAddr (with or without prefix) into its payload kind and
/// 20-byte hash.
pub fn decode_payload(addr: &str, default_hrp: &str) -> WalletResult<(PayloadKind, [u8; 20])> {
    let invalid = || WalletError::InvalidAddress(addr.to_string());

    let (hrp, data) = decode(addr, default_hrp)?;
    if hrp != default_hrp {
        return Err(invalid());
    }

    let conv = convert_bits(&data, 5, 8, false)?;
    if conv.len() != 21 {
        return Err(invalid());
    }
    let kind = match conv[0] {
        0 => PayloadKind::PubkeyHash,
        8 => PayloadKind::ScriptHash,
        _ => return Err(invalid()),
    };
    let hash: [u8; 20] = conv[1..].try_into().map_err(|_| invalid())?;
    Ok((kind, hash))
}
