// Entry point for the ledger-chain CLI
use clap::Parser;
use data_encoding::HEXLOWER;
use ledger_chain::{
    address_to_pub_key_hash, convert_address, hash_pub_key, send_tx, validate_address,
    Blockchain, Command, Config, Opt, ProofOfWork, Server, Transaction, UTXOSet, Wallets,
};
use log::{error, info, LevelFilter};
use std::fs;
use std::process;

fn main() {
    // Info by default; RUST_LOG still wins when set
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    match command {
        Command::Createblockchain { address } => {
            if !validate_address(&address) {
                return Err(format!("Invalid address: {address}").into());
            }
            let blockchain = Blockchain::create_blockchain_with_path(&address, config.db_path())?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            utxo_set.reindex()?;
            blockchain.flush()?;
            println!("Done!");
        }
        Command::Createwallet => {
            fs::create_dir_all(config.get_data_dir())?;
            let mut wallets = Wallets::load_from(config.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let blockchain = Blockchain::open_with_path(config.db_path())?;
            let utxo_set = UTXOSet::new(blockchain);
            let balance = utxo_set.get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load_from(config.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            broadcast,
        } => {
            if !validate_address(&from) {
                return Err(format!("Invalid sender address: {from}").into());
            }
            if !validate_address(&to) {
                return Err(format!("Invalid recipient address: {to}").into());
            }

            let wallets = Wallets::load_from(config.wallet_path())?;
            let wallet = wallets
                .get_wallet(&from)
                .ok_or_else(|| format!("No local wallet for {from}"))?;

            let blockchain = Blockchain::open_with_path(config.db_path())?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let transaction = Transaction::new_utxo_transaction(wallet, &to, amount, &utxo_set)?;

            if broadcast {
                send_tx(
                    config.get_central_node(),
                    config.get_node_addr(),
                    &transaction,
                )?;
                info!(
                    "Transaction {} sent to {}",
                    HEXLOWER.encode(transaction.get_id()),
                    config.get_central_node()
                );
            } else {
                // Mine it right here; the block carries no reward.
                let block = blockchain.mine_block(&[transaction])?;
                utxo_set.update(&block)?;
                blockchain.flush()?;
            }
            println!("Success!")
        }
        Command::Printchain => {
            let blockchain = Blockchain::open_with_path(config.db_path())?;
            for block in blockchain.iterator()? {
                let block = block?;
                println!("============ Block {} ============", block.get_hash_hex());
                println!("Prev. block: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!("Nonce: {}", block.get_nonce());
                println!("PoW: {}", ProofOfWork::validate(&block));
                for tx in block.get_transactions() {
                    println!("{tx}");
                    for input in tx.get_vin() {
                        let from = convert_address(&hash_pub_key(input.get_pub_key()));
                        println!("     (input from {from})");
                    }
                    for output in tx.get_vout() {
                        let to = convert_address(output.get_pub_key_hash());
                        println!("     (output of {} to {to})", output.get_value());
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let blockchain = Blockchain::open_with_path(config.db_path())?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            utxo_set.reindex()?;
            blockchain.flush()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            let mining_addr = miner.or_else(|| config.get_mining_addr().map(str::to_string));
            if let Some(addr) = &mining_addr {
                if !validate_address(addr) {
                    return Err(format!("Invalid miner address: {addr}").into());
                }
                println!("Mining is on. Address to receive rewards: {addr}");
            }
            let config = config.with_mining_addr(mining_addr);

            info!("Starting node {}", config.get_node_addr());
            // A node that has never synced starts from an empty store
            let blockchain = Blockchain::open_or_empty_with_path(config.db_path())?;
            Server::bind(config, blockchain)?.run()?
        }
    }
    Ok(())
}
