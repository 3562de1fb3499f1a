//! Omni-layer simple-send payloads.
//!
//! Omni rides on BTC inside a single OP_RETURN output. The class-C
//! payload for a divisible simple send is 20 bytes:
//! `"omni" || version u16 || type u16 || property u32 || amount u64`,
//! all big-endian, wrapped as `OP_RETURN <push 20> <payload>` for a
//! 22-byte script.

use bitcoin::script::PushBytesBuf;
use bitcoin::{opcodes::all::OP_RETURN, script::Builder, Script, ScriptBuf};

/// Omni property id of Tether USD.
pub const USDT_PROPERTY_ID: u32 = 31;

/// Tokens the Omni endpoints accept.
pub fn property_id_for_token(token: &str) -> Option<u32> {
    match token.to_ascii_uppercase().as_str() {
        "" | "USDT" => Some(USDT_PROPERTY_ID),
        _ => None,
    }
}

/// Builds the 20-byte simple-send payload.
pub fn simple_send_payload(property_id: u32, amount: u64) -> [u8; 20] {
    let mut payload = [0u8; 20];
    payload[..4].copy_from_slice(b"omni");
    // version = 0, type = 0 (simple send)
    payload[8..12].copy_from_slice(&property_id.to_be_bytes());
    payload[12..20].copy_from_slice(&amount.to_be_bytes());
    payload
}

/// Builds the OP_RETURN output script carrying a simple send.
pub fn simple_send_script(property_id: u32, amount: u64) -> ScriptBuf {
    let payload = simple_send_payload(property_id, amount);
    let mut push = PushBytesBuf::new();
    push.extend_from_slice(&payload).expect("20 bytes push");
    Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push)
        .into_script()
}

/// Matches a USDT simple-send OP_RETURN script and extracts the amount.
///
/// The script must be exactly 22 bytes and bytes 2..14 must match the
/// USDT template: magic, version 0, type 0, property id 31.
pub fn parse_usdt_simple_send(script: &Script) -> Option<u64> {
    let bytes = script.as_bytes();
    if bytes.len() != 22 || bytes[0] != OP_RETURN.to_u8() || bytes[1] != 0x14 {
        return None;
    }
    let data = &bytes[2..];
    if &data[..4] != b"omni" {
        return None;
    }
    if data[4..8] != [0, 0, 0, 0] {
        return None;
    }
    if data[8..12] != USDT_PROPERTY_ID.to_be_bytes() {
        return None;
    }
    Some(u64::from_be_bytes(data[12..20].try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use hex::DisplayHex;

    use super::*;

    #[test]
    fn one_usdt_script_bytes() {
        // 1 USDT in Omni's 8-decimal units.
        let script = simple_send_script(USDT_PROPERTY_ID, 100_000_000);
        assert_eq!(
            script.as_bytes().to_lower_hex_string(),
            "6a146f6d6e69000000000000001f0000000005f5e100"
        );
    }

    #[test]
    fn payload_round_trip() {
        let script = simple_send_script(USDT_PROPERTY_ID, 123_456_789);
        assert_eq!(parse_usdt_simple_send(&script), Some(123_456_789));
    }

    #[test]
    fn rejects_foreign_property() {
        let script = simple_send_script(2, 1);
        assert_eq!(parse_usdt_simple_send(&script), None);
    }

    #[test]
    fn rejects_non_omni_op_return() {
        let script = ScriptBuf::new_op_return(b"hello world, this is 20b");
        assert_eq!(parse_usdt_simple_send(&script), None);
        assert_eq!(parse_usdt_simple_send(&ScriptBuf::new()), None);
    }

    #[test]
    fn token_lookup() {
        assert_eq!(property_id_for_token("usdt"), Some(31));
        assert_eq!(property_id_for_token(""), Some(31));
        assert_eq!(property_id_for_token("PEPE"), None);
    }
}
