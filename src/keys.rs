//! HD key derivation and the address registry.
//!
//! The wallet derives addresses from a single account-level xpub at
//! `m / branch / index`. Branch 0 is handed to depositors; branch 1 holds
//! change and is the only branch the local xpriv ever signs for.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::hashes::Hash;
use dashmap::DashMap;
use parking_lot::Mutex;
use secp256k1::{SecretKey, SECP256K1};

use crate::{
    cashaddr,
    chain::{encode_base58, Chain},
    error::{WalletError, WalletResult},
};

/// The derivation branch below the account level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Branch {
    /// Receive addresses handed out to depositors.
    External,
    /// Change addresses the wallet spends from.
    Internal,
}

impl Branch {
    pub fn as_u32(self) -> u32 {
        match self {
            Branch::External => 0,
            Branch::Internal => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Branch> {
        match v {
            0 => Some(Branch::External),
            1 => Some(Branch::Internal),
            _ => None,
        }
    }

    fn child_number(self) -> ChildNumber {
        ChildNumber::Normal { index: self.as_u32() }
    }
}

/// The derivation path of one owned address, below the account level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddrPath {
    pub branch: Branch,
    pub index: u32,
}

impl AddrPath {
    pub fn external(index: u32) -> AddrPath {
        AddrPath { branch: Branch::External, index }
    }

    pub fn internal(index: u32) -> AddrPath {
        AddrPath { branch: Branch::Internal, index }
    }
}

impl fmt::Display for AddrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch.as_u32(), self.index)
    }
}

impl FromStr for AddrPath {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WalletError::Decode(format!("bad address path: {s}"));
        let (branch, index) = s.split_once('/').ok_or_else(invalid)?;
        let branch = branch
            .parse::<u32>()
            .ok()
            .and_then(Branch::from_u32)
            .ok_or_else(invalid)?;
        let index = index.parse::<u32>().map_err(|_| invalid())?;
        Ok(AddrPath { branch, index })
    }
}

/// Derives the compressed public key at `m / branch / index` of `xpub`.
pub fn derive_pubkey(xpub: &Xpub, path: AddrPath) -> WalletResult<[u8; 33]> {
    let index = ChildNumber::from_normal_idx(path.index).map_err(|_| WalletError::InvalidKey)?;
    let child = xpub
        .derive_pub(&*SECP256K1, &[path.branch.child_number(), index])
        .map_err(|_| WalletError::InvalidKey)?;
    Ok(child.to_pub().to_bytes())
}

/// Derives the private key at `m / branch / index` of `xpriv`.
///
/// Spending requires the exact derivation used to produce the receiving
/// address, branch included.
pub fn derive_privkey(xpriv: &Xpriv, path: AddrPath) -> WalletResult<SecretKey> {
    let index = ChildNumber::from_normal_idx(path.index).map_err(|_| WalletError::InvalidKey)?;
    let child = xpriv
        .derive_priv(&*SECP256K1, &[path.branch.child_number(), index])
        .map_err(|_| WalletError::InvalidKey)?;
    Ok(child.private_key)
}

/// Encodes the wallet-visible address of `pubkey` on `chain`.
///
/// Legacy chains get Base58Check P2PKH; BCH re-encodes the same hash as a
/// CashAddr and strips the prefix, which is the form callers see.
pub fn pubkey_to_address(chain: Chain, pubkey: &[u8; 33]) -> String {
    let hash = bitcoin::hashes::hash160::Hash::hash(pubkey);
    let hash: [u8; 20] = *hash.as_byte_array();
    match chain.params().cashaddr_hrp {
        Some(hrp) => cashaddr::encode_payload(hrp, cashaddr::PayloadKind::PubkeyHash, &hash),
        None => encode_base58(chain.params().pubkey_hash_id, &hash),
    }
}

/// Derives the address at `path` from `xpub` for `chain`.
pub fn derive_address(xpub: &Xpub, chain: Chain, path: AddrPath) -> WalletResult<String> {
    let pubkey = derive_pubkey(xpub, path)?;
    Ok(pubkey_to_address(chain, &pubkey))
}

#[derive(Clone, Copy, Debug)]
struct Indices {
    ext: u32,
    int: u32,
}

/// The registry of owned addresses.
///
/// Exclusively owns the address-to-path map and the two rolling indices.
/// Lookups are lock-free; issuance serializes derive + record + advance
/// through the index mutex.
pub struct AddressBook {
    paths: DashMap<String, AddrPath>,
    indices: Mutex<Indices>,
}

impl AddressBook {
    pub fn new(ext_index: u32, int_index: u32) -> Self {
        Self {
            paths: DashMap::new(),
            indices: Mutex::new(Indices { ext: ext_index, int: int_index }),
        }
    }

    /// Populates the map with every address below the current rolling
    /// indices: `0/0..ext` and `1/0..int`.
    pub fn rehydrate(&self, xpub: &Xpub, chain: Chain) -> WalletResult<()> {
        let indices = *self.indices.lock();
        for index in 0..indices.ext {
            let path = AddrPath::external(index);
            self.paths.insert(derive_address(xpub, chain, path)?, path);
        }
        for index in 0..indices.int {
            let path = AddrPath::internal(index);
            self.paths.insert(derive_address(xpub, chain, path)?, path);
        }
        Ok(())
    }

    /// Issues the next external (deposit) address and advances `ext`.
    pub fn issue_external(&self, xpub: &Xpub, chain: Chain) -> WalletResult<String> {
        let mut indices = self.indices.lock();
        let path = AddrPath::external(indices.ext);
        let addr = derive_address(xpub, chain, path)?;
        self.paths.insert(addr.clone(), path);
        indices.ext += 1;
        Ok(addr)
    }

    /// Derives the change address at the current internal index and
    /// records its path, without advancing. The index only moves once the
    /// change output actually lands in an emitted transaction, via
    /// [`AddressBook::commit_change`].
    pub fn change_address(&self, xpub: &Xpub, chain: Chain) -> WalletResult<String> {
        let indices = self.indices.lock();
        let path = AddrPath::internal(indices.int);
        let addr = derive_address(xpub, chain, path)?;
        self.paths.insert(addr.clone(), path);
        Ok(addr)
    }

    /// Advances the internal index past a change address that was used.
    pub fn commit_change(&self) {
        self.indices.lock().int += 1;
    }

    pub fn lookup(&self, addr: &str) -> Option<AddrPath> {
        self.paths.get(addr).map(|p| *p)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.paths.contains_key(addr)
    }

    /// Records an address at a known path. Used for rehydration and by
    /// tests building fixed registries.
    pub fn record(&self, addr: String, path: AddrPath) {
        self.paths.insert(addr, path);
    }

    /// Current `(ext, int)` rolling indices.
    pub fn indices(&self) -> (u32, u32) {
        let indices = self.indices.lock();
        (indices.ext, indices.int)
    }

    /// All recorded internal-branch addresses.
    pub fn internal_addresses(&self) -> Vec<String> {
        self.paths
            .iter()
            .filter(|e| e.value().branch == Branch::Internal)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP32 test vector 1 master keys.
    pub(crate) const TEST_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    pub(crate) const TEST_XPRIV: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";

    #[test]
    fn addr_path_display_parse() {
        let path = AddrPath::external(5);
        assert_eq!(path.to_string(), "0/5");
        assert_eq!("0/5".parse::<AddrPath>().unwrap(), path);
        assert_eq!("1/42".parse::<AddrPath>().unwrap(), AddrPath::internal(42));
        assert!("2/1".parse::<AddrPath>().is_err());
        assert!("x".parse::<AddrPath>().is_err());
    }

    #[test]
    fn known_pubkey_encodes_to_known_address() {
        // Compressed key and address pair from the ubiquitous secp256k1
        // worked example.
        use hex::FromHex;
        let bytes = Vec::<u8>::from_hex(
            "0250863ad64a87ae8a2fe83c1af1a8403cb53f53e486d8511dad8a04887e5b2352",
        )
        .unwrap();
        let pubkey: [u8; 33] = bytes.try_into().unwrap();
        assert_eq!(
            pubkey_to_address(Chain::Btc, &pubkey),
            "1PMycacnJaSqwwJqjawXBErnLsZ7RkXUAs"
        );
    }

    #[test]
    fn derivation_is_deterministic_and_branch_sensitive() {
        let xpub: Xpub = TEST_XPUB.parse().unwrap();
        let a = derive_address(&xpub, Chain::Btc, AddrPath::external(0)).unwrap();
        let b = derive_address(&xpub, Chain::Btc, AddrPath::external(0)).unwrap();
        let c = derive_address(&xpub, Chain::Btc, AddrPath::internal(0)).unwrap();
        let d = derive_address(&xpub, Chain::Btc, AddrPath::external(1)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn xpriv_matches_xpub_derivation() {
        let xpub: Xpub = TEST_XPUB.parse().unwrap();
        let xpriv: Xpriv = TEST_XPRIV.parse().unwrap();
        let path = AddrPath::internal(7);
        let pubkey = derive_pubkey(&xpub, path).unwrap();
        let secret = derive_privkey(&xpriv, path).unwrap();
        assert_eq!(secret.public_key(&*SECP256K1).serialize(), pubkey);
    }

    #[test]
    fn issue_external_advances_by_one() {
        let xpub: Xpub = TEST_XPUB.parse().unwrap();
        let book = AddressBook::new(0, 0);
        let a0 = book.issue_external(&xpub, Chain::Btc).unwrap();
        let a1 = book.issue_external(&xpub, Chain::Btc).unwrap();
        assert_ne!(a0, a1);
        assert_eq!(book.indices(), (2, 0));
        assert_eq!(book.lookup(&a0), Some(AddrPath::external(0)));
        assert_eq!(book.lookup(&a1), Some(AddrPath::external(1)));
    }

    #[test]
    fn change_index_advances_only_on_commit() {
        let xpub: Xpub = TEST_XPUB.parse().unwrap();
        let book = AddressBook::new(0, 0);
        let c0 = book.change_address(&xpub, Chain::Btc).unwrap();
        let c1 = book.change_address(&xpub, Chain::Btc).unwrap();
        assert_eq!(c0, c1, "uncommitted change address is reused");
        assert_eq!(book.indices(), (0, 0));

        book.commit_change();
        let c2 = book.change_address(&xpub, Chain::Btc).unwrap();
        assert_ne!(c0, c2);
        assert_eq!(book.indices(), (0, 1));
    }

    #[test]
    fn rehydrate_restores_paths() {
        let xpub: Xpub = TEST_XPUB.parse().unwrap();
        let book = AddressBook::new(3, 2);
        book.rehydrate(&xpub, Chain::Btc).unwrap();
        assert_eq!(book.len(), 5);

        let again = derive_address(&xpub, Chain::Btc, AddrPath::external(2)).unwrap();
        assert_eq!(book.lookup(&again), Some(AddrPath::external(2)));
        assert_eq!(book.internal_addresses().len(), 2);
    }

    #[test]
    fn bch_addresses_are_stripped_cashaddr() {
        let xpub: Xpub = TEST_XPUB.parse().unwrap();
        let addr = derive_address(&xpub, Chain::Bch, AddrPath::external(0)).unwrap();
        assert!(!addr.contains(':'));
        assert!(crate::cashaddr::decode_payload(&addr, "bitcoincash").is_ok());
    }
}
