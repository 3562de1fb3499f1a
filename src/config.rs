//! Service configuration.
//!
//! Read once from an INI file at startup. The rolling address indices
//! and the last-processed height are written back on a 60-second tick
//! and at shutdown; everything else in the file is left untouched.

use std::path::{Path, PathBuf};

use ini::Ini;

use crate::{
    chain::Chain,
    error::{WalletError, WalletResult},
};

/// Parsed configuration snapshot.
#[derive(Clone, Debug)]
pub struct Config {
    pub chain: Chain,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_pass: String,
    pub port: u16,

    pub xpub: String,
    pub xpriv: String,
    pub account_id: u32,
    pub ext_index: u32,
    pub int_index: u32,

    pub last_block: u64,
    pub fee_rate: u64,
    pub zmq_url: String,
    pub db_dir: PathBuf,
}

fn get<'a>(ini: &'a Ini, section: &str, key: &str) -> WalletResult<&'a str> {
    ini.get_from(Some(section), key)
        .ok_or_else(|| WalletError::ConfigInvalid(format!("missing [{section}] {key}")))
}

fn get_or<'a>(ini: &'a Ini, section: &str, key: &str, default: &'a str) -> &'a str {
    ini.get_from(Some(section), key).unwrap_or(default)
}

fn parse<T: std::str::FromStr>(section: &str, key: &str, raw: &str) -> WalletResult<T> {
    raw.parse()
        .map_err(|_| WalletError::ConfigInvalid(format!("bad [{section}] {key}: {raw}")))
}

impl Config {
    pub fn load(path: &Path) -> WalletResult<Config> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| WalletError::ConfigInvalid(format!("{}: {e}", path.display())))?;

        let testnet: u32 = parse("network", "testnet", get_or(&ini, "network", "testnet", "0"))?;
        let chain_name = get(&ini, "network", "chain")?;
        let chain = match Chain::from_name(chain_name) {
            Some(Chain::Btc) if testnet != 0 => Chain::BtcTest,
            Some(chain) => chain,
            None => return Err(WalletError::UnknownChain(chain_name.to_string())),
        };

        Ok(Config {
            chain,
            rpc_url: get(&ini, "network", "rpc_host")?.to_string(),
            rpc_user: get_or(&ini, "network", "rpc_user", "").to_string(),
            rpc_pass: get_or(&ini, "network", "rpc_pass", "").to_string(),
            port: parse("network", "port", get_or(&ini, "network", "port", "8081"))?,

            xpub: get(&ini, "account", "xpub")?.to_string(),
            xpriv: get_or(&ini, "account", "xpriv", "").to_string(),
            account_id: parse("account", "id", get_or(&ini, "account", "id", "0"))?,
            ext_index: parse("account", "index", get_or(&ini, "account", "index", "0"))?,
            int_index: parse(
                "account",
                "change_index",
                get_or(&ini, "account", "change_index", "0"),
            )?,

            last_block: parse("extapi", "lastBlock", get_or(&ini, "extapi", "lastBlock", "0"))?,
            fee_rate: parse("extapi", "feerate", get_or(&ini, "extapi", "feerate", "1000"))?,
            zmq_url: get(&ini, "extapi", "zmq")?.to_string(),
            db_dir: PathBuf::from(get(&ini, "extapi", "dbDir")?),
        })
    }

    /// Writes the mutable state back into the file, preserving every
    /// other key. The persisted height is `last_block - 3` so a restart
    /// reprocesses the confirmation window.
    pub fn persist(
        path: &Path,
        ext_index: u32,
        int_index: u32,
        last_block: u64,
    ) -> WalletResult<()> {
        let mut ini = Ini::load_from_file(path)
            .map_err(|e| WalletError::ConfigInvalid(format!("{}: {e}", path.display())))?;

        ini.with_section(Some("account"))
            .set("index", ext_index.to_string())
            .set("change_index", int_index.to_string());
        ini.with_section(Some("extapi"))
            .set("lastBlock", last_block.saturating_sub(3).to_string());

        ini.write_to_file(path)
            .map_err(|e| WalletError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = "\
[network]
testnet = 0
chain = btc
rpc_host = http://127.0.0.1:8332
rpc_user = rpc
rpc_pass = secret
port = 8081

[account]
xpub = xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8
xpriv =
id = 0
index = 12
change_index = 4

[extapi]
lastBlock = 700123
feerate = 2000
zmq = tcp://127.0.0.1:28332
dbDir = /var/lib/hotwalletd/utxo
";

    fn write_sample() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_all_fields() {
        let file = write_sample();
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.chain, Chain::Btc);
        assert_eq!(config.rpc_url, "http://127.0.0.1:8332");
        assert_eq!(config.port, 8081);
        assert_eq!(config.ext_index, 12);
        assert_eq!(config.int_index, 4);
        assert_eq!(config.last_block, 700_123);
        assert_eq!(config.fee_rate, 2000);
        assert_eq!(config.zmq_url, "tcp://127.0.0.1:28332");
    }

    #[test]
    fn testnet_flag_switches_chain() {
        let file = write_sample();
        let mut ini = Ini::load_from_file(file.path()).unwrap();
        ini.with_section(Some("network")).set("testnet", "1");
        ini.write_to_file(file.path()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.chain, Chain::BtcTest);
    }

    #[test]
    fn unknown_chain_is_rejected() {
        let file = write_sample();
        let mut ini = Ini::load_from_file(file.path()).unwrap();
        ini.with_section(Some("network")).set("chain", "doge");
        ini.write_to_file(file.path()).unwrap();

        match Config::load(file.path()) {
            Err(WalletError::UnknownChain(name)) => assert_eq!(name, "doge"),
            other => panic!("expected unknown chain, got {other:?}"),
        }
    }

    #[test]
    fn persist_rewinds_checkpoint() {
        let file = write_sample();
        Config::persist(file.path(), 15, 6, 700_200).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.ext_index, 15);
        assert_eq!(config.int_index, 6);
        assert_eq!(config.last_block, 700_197);
        // Untouched keys survive the rewrite.
        assert_eq!(config.rpc_pass, "secret");
    }

    #[test]
    fn persist_saturates_at_zero() {
        let file = write_sample();
        Config::persist(file.path(), 0, 0, 2).unwrap();
        assert_eq!(Config::load(file.path()).unwrap().last_block, 0);
    }
}
