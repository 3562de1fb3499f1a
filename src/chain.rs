//! Chain parameters for the Bitcoin-family networks the wallet operates.

use bitcoin::{base58, Address, Network, PubkeyHash, Script, ScriptBuf, ScriptHash};
use bitcoin::hashes::Hash;

use crate::{
    cashaddr,
    error::{WalletError, WalletResult},
};

/// A supported chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Chain {
    Btc,
    BtcTest,
    Bch,
    Bsv,
    Dsc,
}

/// Address-encoding and derivation constants of one chain.
#[derive(Clone, Copy, Debug)]
pub struct ChainParams {
    /// Lowercase chain name as it appears in configuration.
    pub name: &'static str,
    /// Base58 version byte for P2PKH addresses.
    pub pubkey_hash_id: u8,
    /// Base58 version byte for P2SH addresses.
    pub script_hash_id: u8,
    /// CashAddr human-readable prefix, for chains encoding CashAddr.
    pub cashaddr_hrp: Option<&'static str>,
    /// BIP44 coin type used in hardware-wallet derivation paths.
    pub bip44_coin_type: u32,
}

const BTC_PARAMS: ChainParams = ChainParams {
    name: "btc",
    pubkey_hash_id: 0x00, // starts with 1
    script_hash_id: 0x05, // starts with 3
    cashaddr_hrp: None,
    bip44_coin_type: 0,
};

const BTC_TEST_PARAMS: ChainParams = ChainParams {
    name: "btctest",
    pubkey_hash_id: 0x6f, // starts with m or n
    script_hash_id: 0xc4, // starts with 2
    cashaddr_hrp: None,
    bip44_coin_type: 1,
};

const BCH_PARAMS: ChainParams = ChainParams {
    name: "bch",
    pubkey_hash_id: 0x00,
    script_hash_id: 0x05,
    cashaddr_hrp: Some("bitcoincash"),
    bip44_coin_type: 145,
};

const BSV_PARAMS: ChainParams = ChainParams {
    name: "bsv",
    pubkey_hash_id: 0x00,
    script_hash_id: 0x05,
    cashaddr_hrp: None,
    bip44_coin_type: 236,
};

const DSC_PARAMS: ChainParams = ChainParams {
    name: "dsc",
    pubkey_hash_id: 0x1e, // starts with D
    script_hash_id: 0x10, // starts with 7
    cashaddr_hrp: None,
    bip44_coin_type: 1208,
};

impl Chain {
    /// Looks a chain up by its configured name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Chain> {
        match name.to_ascii_lowercase().as_str() {
            "btc" => Some(Chain::Btc),
            "btctest" => Some(Chain::BtcTest),
            "bch" => Some(Chain::Bch),
            "bsv" => Some(Chain::Bsv),
            "dsc" => Some(Chain::Dsc),
            _ => None,
        }
    }

    pub fn params(&self) -> &'static ChainParams {
        match self {
            Chain::Btc => &BTC_PARAMS,
            Chain::BtcTest => &BTC_TEST_PARAMS,
            Chain::Bch => &BCH_PARAMS,
            Chain::Bsv => &BSV_PARAMS,
            Chain::Dsc => &DSC_PARAMS,
        }
    }

    /// Ticker symbol carried in notifications.
    pub fn symbol(&self) -> &'static str {
        match self {
            Chain::Btc | Chain::BtcTest => "BTC",
            Chain::Bch => "BCH",
            Chain::Bsv => "BSV",
            Chain::Dsc => "DSC",
        }
    }

    /// Coin name understood by Trezor Connect.
    pub fn trezor_coin(&self) -> &'static str {
        match self {
            Chain::Btc => "Bitcoin",
            Chain::BtcTest => "Testnet",
            Chain::Bch => "Bcash",
            Chain::Bsv => "Bsv",
            Chain::Dsc => "Dashcash",
        }
    }

    /// Whether addresses are exposed to callers in CashAddr form.
    pub fn uses_cashaddr(&self) -> bool {
        self.params().cashaddr_hrp.is_some()
    }

    /// Whether the Omni layer rides on this chain.
    pub fn supports_omni(&self) -> bool {
        matches!(self, Chain::Btc | Chain::BtcTest)
    }

    /// Whether signatures must commit to the input amount under
    /// `SIGHASH_FORKID`.
    pub fn uses_forkid(&self) -> bool {
        matches!(self, Chain::Bch | Chain::Bsv)
    }

    /// The `bitcoin` crate network, for the chains it models natively.
    fn btc_network(&self) -> Option<Network> {
        match self {
            Chain::Btc => Some(Network::Bitcoin),
            Chain::BtcTest => Some(Network::Testnet),
            _ => None,
        }
    }
}

/// Extracts the wallet-visible address encoding of an output script.
///
/// Returns `None` for scripts with no address form (OP_RETURN, bare
/// pubkeys, nonstandard scripts) and for witness programs on chains
/// without a native-segwit encoding.
pub fn script_to_address(chain: Chain, script: &Script) -> Option<String> {
    if let Some(network) = chain.btc_network() {
        return Address::from_script(script, network)
            .ok()
            .map(|a| a.to_string());
    }

    let params = chain.params();
    if script.is_p2pkh() {
        let hash: [u8; 20] = script.as_bytes()[3..23].try_into().ok()?;
        return Some(match params.cashaddr_hrp {
            Some(hrp) => cashaddr::encode_payload(hrp, cashaddr::PayloadKind::PubkeyHash, &hash),
            None => encode_base58(params.pubkey_hash_id, &hash),
        });
    }
    if script.is_p2sh() {
        let hash: [u8; 20] = script.as_bytes()[2..22].try_into().ok()?;
        return Some(match params.cashaddr_hrp {
            Some(hrp) => cashaddr::encode_payload(hrp, cashaddr::PayloadKind::ScriptHash, &hash),
            None => encode_base58(params.script_hash_id, &hash),
        });
    }
    None
}

/// Builds the output script paying to `address` on `chain`.
pub fn address_to_script(chain: Chain, address: &str) -> WalletResult<ScriptBuf> {
    if let Some(network) = chain.btc_network() {
        let addr = address
            .parse::<Address<_>>()
            .map_err(|_| WalletError::InvalidAddress(address.to_string()))?
            .require_network(network)
            .map_err(|_| WalletError::InvalidAddress(address.to_string()))?;
        return Ok(addr.script_pubkey());
    }

    let params = chain.params();
    if let Some(hrp) = params.cashaddr_hrp {
        let (kind, hash) = cashaddr::decode_payload(address, hrp)?;
        return Ok(match kind {
            cashaddr::PayloadKind::PubkeyHash => {
                ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash))
            }
            cashaddr::PayloadKind::ScriptHash => {
                ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash))
            }
        });
    }

    let (version, hash) = decode_base58(address)?;
    if version == params.pubkey_hash_id {
        Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)))
    } else if version == params.script_hash_id {
        Ok(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash)))
    } else {
        Err(WalletError::InvalidAddress(address.to_string()))
    }
}

/// Whether `address` is well formed for `chain`.
pub fn verify_address(chain: Chain, address: &str) -> bool {
    address_to_script(chain, address).is_ok()
}

/// Base58Check-encodes a 20-byte hash under the given version byte.
pub fn encode_base58(version: u8, hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);
    base58::encode_check(&payload)
}

/// Decodes a Base58Check address into its version byte and 20-byte hash.
pub fn decode_base58(address: &str) -> WalletResult<(u8, [u8; 20])> {
    let payload = base58::decode_check(address)
        .map_err(|_| WalletError::InvalidAddress(address.to_string()))?;
    if payload.len() != 21 {
        return Err(WalletError::InvalidAddress(address.to_string()));
    }
    let hash: [u8; 20] = payload[1..]
        .try_into()
        .map_err(|_| WalletError::InvalidAddress(address.to_string()))?;
    Ok((payload[0], hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_lookup() {
        assert_eq!(Chain::from_name("BTC"), Some(Chain::Btc));
        assert_eq!(Chain::from_name("btctest"), Some(Chain::BtcTest));
        assert_eq!(Chain::from_name("dsc"), Some(Chain::Dsc));
        assert_eq!(Chain::from_name("doge"), None);
    }

    #[test]
    fn base58_round_trip() {
        let hash = [0x11u8; 20];
        for chain in [Chain::Btc, Chain::Dsc, Chain::Bsv] {
            let addr = encode_base58(chain.params().pubkey_hash_id, &hash);
            let (version, decoded) = decode_base58(&addr).unwrap();
            assert_eq!(version, chain.params().pubkey_hash_id);
            assert_eq!(decoded, hash);
        }
    }

    #[test]
    fn p2pkh_script_round_trip() {
        let hash = [0x42u8; 20];
        for chain in [Chain::Btc, Chain::Dsc, Chain::Bsv, Chain::Bch] {
            let script = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash));
            let addr = script_to_address(chain, &script).unwrap();
            assert_eq!(address_to_script(chain, &addr).unwrap(), script);
        }
    }

    #[test]
    fn p2sh_script_round_trip() {
        let hash = [0x24u8; 20];
        for chain in [Chain::Btc, Chain::Dsc, Chain::Bch] {
            let script = ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash));
            let addr = script_to_address(chain, &script).unwrap();
            assert_eq!(address_to_script(chain, &addr).unwrap(), script);
        }
    }

    #[test]
    fn op_return_has_no_address() {
        let script = ScriptBuf::new_op_return(b"hello");
        assert_eq!(script_to_address(Chain::Btc, &script), None);
        assert_eq!(script_to_address(Chain::Dsc, &script), None);
    }

    #[test]
    fn rejects_wrong_chain_version() {
        let hash = [0x31u8; 20];
        let dsc = encode_base58(Chain::Dsc.params().pubkey_hash_id, &hash);
        assert!(verify_address(Chain::Dsc, &dsc));
        assert!(!verify_address(Chain::Btc, &dsc));
    }

    #[test]
    fn btc_segwit_destinations_are_spendable_to() {
        // Native segwit is a valid destination on BTC even though the
        // wallet itself only holds P2PKH outputs.
        let addr = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        assert!(verify_address(Chain::Btc, addr));
        assert!(!verify_address(Chain::Dsc, addr));
    }
}
