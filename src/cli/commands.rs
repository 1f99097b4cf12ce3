use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ledger-chain", about = "A minimal proof-of-work ledger node")]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    #[command(name = "createblockchain", about = "Create a new blockchain")]
    Createblockchain {
        #[arg(help = "The address to send genesis block reward to")]
        address: String,
    },
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(
        name = "getbalance",
        about = "Get the wallet balance of the target address"
    )]
    GetBalance {
        #[arg(help = "The wallet address")]
        address: String,
    },
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(name = "send", about = "Send coins between addresses")]
    Send {
        #[arg(help = "Source wallet address")]
        from: String,
        #[arg(help = "Destination wallet address")]
        to: String,
        #[arg(help = "Amount to send")]
        amount: u64,
        #[arg(
            long = "broadcast",
            help = "Hand the transaction to the central node instead of mining it locally"
        )]
        broadcast: bool,
    },
    #[command(name = "printchain", about = "Print all blocks in the blockchain")]
    Printchain,
    #[command(name = "reindexutxo", about = "Rebuild UTXO index set")]
    Reindexutxo,
    #[command(name = "startnode", about = "Start a node")]
    StartNode {
        #[arg(
            long = "miner",
            value_name = "ADDRESS",
            help = "Enable mining mode and send rewards to ADDRESS"
        )]
        miner: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_parses_broadcast_flag() {
        let opt = Opt::try_parse_from(["ledger-chain", "send", "a", "b", "30", "--broadcast"])
            .unwrap();
        assert_eq!(
            opt.command,
            Command::Send {
                from: "a".to_string(),
                to: "b".to_string(),
                amount: 30,
                broadcast: true,
            }
        );
    }

    #[test]
    fn test_startnode_miner_is_optional() {
        let opt = Opt::try_parse_from(["ledger-chain", "startnode"]).unwrap();
        assert_eq!(opt.command, Command::StartNode { miner: None });

        let opt = Opt::try_parse_from(["ledger-chain", "startnode", "--miner", "addr"]).unwrap();
        assert_eq!(
            opt.command,
            Command::StartNode {
                miner: Some("addr".to_string())
            }
        );
    }

    #[test]
    fn test_bad_usage_is_rejected() {
        assert!(Opt::try_parse_from(["ledger-chain", "send", "a", "b", "lots"]).is_err());
        assert!(Opt::try_parse_from(["ledger-chain", "mint"]).is_err());
    }
}
