//! Command-line options the node consumes.

use std::path::PathBuf;

use neutrond_consensus::constants::DEFAULT_LIMIT_FREE_RELAY;
use neutrond_consensus::params::Network;

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub network: Network,
    pub data_dir: PathBuf,
    /// Thousand-bytes-per-minute budget for free transaction relay.
    pub limit_free_relay: u64,
    /// Shell command run when the best block changes; `%s` becomes the
    /// new tip hash.
    pub blocknotify: Option<String>,
    /// Randomly drop one in N incoming messages, for testing.
    pub drop_messages_test: u64,
    pub print_coinage: bool,
    pub print_coinstake: bool,
    /// Trust peer-reported time offsets when computing adjusted time.
    pub sync_time: bool,
    pub log_level: neutrond_log::Level,
    pub log_format: neutrond_log::Format,
    /// Bootstrap file to import at startup.
    pub import_file: Option<PathBuf>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: PathBuf::from(".neutrond"),
            limit_free_relay: DEFAULT_LIMIT_FREE_RELAY,
            blocknotify: None,
            drop_messages_test: 0,
            print_coinage: false,
            print_coinstake: false,
            sync_time: true,
            log_level: neutrond_log::Level::Info,
            log_format: neutrond_log::Format::Text,
            import_file: None,
        }
    }
}

pub fn parse_args<I>(raw_args: I) -> Result<NodeOptions, String>
where
    I: IntoIterator<Item = String>,
{
    let mut options = NodeOptions::default();
    let mut data_dir_set = false;

    for arg in raw_args {
        let (flag, value) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };

        match flag.as_str() {
            "-testnet" => {
                options.network = Network::Testnet;
                if !data_dir_set {
                    options.data_dir = PathBuf::from(".neutrond-testnet");
                }
            }
            "-datadir" => {
                let value = required(&flag, value)?;
                options.data_dir = PathBuf::from(value);
                data_dir_set = true;
            }
            "-limitfreerelay" => {
                let value = required(&flag, value)?;
                options.limit_free_relay = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid value for {flag}"))?;
            }
            "-blocknotify" => {
                options.blocknotify = Some(required(&flag, value)?);
            }
            "-dropmessagestest" => {
                let value = required(&flag, value)?;
                options.drop_messages_test = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid value for {flag}"))?;
            }
            "-printcoinage" => options.print_coinage = true,
            "-printcoinstake" => options.print_coinstake = true,
            "-synctime" => {
                options.sync_time = match value.as_deref() {
                    None | Some("1") | Some("true") => true,
                    Some("0") | Some("false") => false,
                    Some(_) => return Err(format!("invalid value for {flag}")),
                };
            }
            "-loglevel" => {
                let value = required(&flag, value)?;
                options.log_level = neutrond_log::Level::parse(&value)
                    .ok_or_else(|| format!("invalid value for {flag}"))?;
            }
            "-logformat" => {
                let value = required(&flag, value)?;
                options.log_format = neutrond_log::Format::parse(&value)
                    .ok_or_else(|| format!("invalid value for {flag}"))?;
            }
            "-loadblock" => {
                options.import_file = Some(PathBuf::from(required(&flag, value)?));
            }
            other => return Err(format!("unknown option {other}")),
        }
    }

    Ok(options)
}

fn required(flag: &str, value: Option<String>) -> Result<String, String> {
    value.ok_or_else(|| format!("{flag} requires a value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn defaults() {
        let options = parse_args(args(&[])).expect("parse");
        assert_eq!(options.network, Network::Mainnet);
        assert_eq!(options.limit_free_relay, DEFAULT_LIMIT_FREE_RELAY);
        assert!(options.blocknotify.is_none());
    }

    #[test]
    fn testnet_switches_datadir() {
        let options = parse_args(args(&["-testnet"])).expect("parse");
        assert_eq!(options.network, Network::Testnet);
        assert_eq!(options.data_dir, PathBuf::from(".neutrond-testnet"));
    }

    #[test]
    fn explicit_datadir_wins() {
        let options =
            parse_args(args(&["-datadir=/tmp/chain", "-testnet"])).expect("parse");
        assert_eq!(options.data_dir, PathBuf::from("/tmp/chain"));
    }

    #[test]
    fn values_parse() {
        let options = parse_args(args(&[
            "-limitfreerelay=25",
            "-blocknotify=echo %s",
            "-dropmessagestest=10",
            "-printcoinage",
        ]))
        .expect("parse");
        assert_eq!(options.limit_free_relay, 25);
        assert_eq!(options.blocknotify.as_deref(), Some("echo %s"));
        assert_eq!(options.drop_messages_test, 10);
        assert!(options.print_coinage);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse_args(args(&["-bogus"])).is_err());
    }
}
