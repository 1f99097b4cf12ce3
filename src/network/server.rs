use crate::config::Config;
use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::message::{
    AddrPayload, BlockPayload, GetBlocksPayload, GetDataPayload, InvPayload, OpType, Package,
    TxPayload, VersionPayload,
};
use crate::network::Nodes;
use crate::storage::{BlockInTransit, MemoryPool, OrphanBlocks, UTXOSet};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const NODE_VERSION: i64 = 1;
const TCP_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);
const TCP_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Largest message a peer may send; anything longer is dropped unread.
pub const MAX_MESSAGE_BYTES: u64 = 32 * 1024 * 1024;

/// Everything a running node shares between its connection handlers.
pub struct NodeState {
    config: Config,
    blockchain: Blockchain,
    known_nodes: Nodes,
    memory_pool: MemoryPool,
    blocks_in_transit: BlockInTransit,
    /// Received blocks whose parent is not stored yet.
    orphans: Mutex<OrphanBlocks>,
    mining: Mutex<()>,
    shutdown: Arc<AtomicBool>,
}

impl NodeState {
    pub fn new(config: Config, blockchain: Blockchain) -> NodeState {
        let known_nodes = Nodes::new();
        known_nodes.add_node(config.get_central_node());
        NodeState {
            config,
            blockchain,
            known_nodes,
            memory_pool: MemoryPool::new(),
            blocks_in_transit: BlockInTransit::new(),
            orphans: Mutex::new(OrphanBlocks::default()),
            mining: Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn get_known_nodes(&self) -> &Nodes {
        &self.known_nodes
    }

    pub fn get_memory_pool(&self) -> &MemoryPool {
        &self.memory_pool
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn node_addr(&self) -> &str {
        self.config.get_node_addr()
    }

    // Known peers other than this node.
    fn peers(&self) -> Vec<String> {
        self.known_nodes
            .get_addrs()
            .into_iter()
            .filter(|addr| addr != self.node_addr())
            .collect()
    }

    fn lock_orphans(&self) -> MutexGuard<'_, OrphanBlocks> {
        self.orphans.lock().unwrap_or_else(|poisoned| {
            error!("Recovering poisoned orphan buffer lock");
            poisoned.into_inner()
        })
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let peer_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        stream
            .set_read_timeout(Some(TCP_READ_TIMEOUT))
            .map_err(|e| BlockchainError::Network(format!("Failed to set read timeout: {e}")))?;

        let request = read_message(&mut stream, MAX_MESSAGE_BYTES);
        let _ = stream.shutdown(Shutdown::Both);
        let request = match request? {
            Some(request) => request,
            None => {
                warn!("Dropping message from {peer_addr}: larger than {MAX_MESSAGE_BYTES} bytes");
                return Ok(());
            }
        };
        if request.is_empty() {
            return Ok(());
        }

        let package = match Package::decode(&request) {
            Ok(package) => package,
            Err(e) => {
                warn!("Ignoring message from {peer_addr}: {e}");
                return Ok(());
            }
        };
        info!("Received {} command from {peer_addr}", package.command());
        self.process_message(package)
    }

    fn process_message(&self, package: Package) -> Result<()> {
        match package {
            Package::Version(payload) => self.handle_version(payload),
            Package::Addr(payload) => self.handle_addr(payload),
            Package::Inv(payload) => self.handle_inv(payload),
            Package::GetBlocks(payload) => self.handle_get_blocks(payload),
            Package::GetData(payload) => self.handle_get_data(payload),
            Package::Block(payload) => self.handle_block(payload),
            Package::Tx(payload) => self.handle_tx(payload),
        }
    }

    fn handle_version(&self, payload: VersionPayload) -> Result<()> {
        let VersionPayload {
            version,
            best_height,
            addr_from,
        } = payload;
        debug!("Version {version} from {addr_from}, best_height={best_height}");

        let newly_known = self.known_nodes.add_node(&addr_from);
        if newly_known && self.config.is_central_node() {
            self.send_addr(&addr_from)?;
        }

        let local_best_height = self.blockchain.get_best_height()?;
        if local_best_height < best_height {
            self.send_get_blocks(&addr_from)?;
        } else if local_best_height > best_height {
            self.send_version(&addr_from)?;
        }
        Ok(())
    }

    fn handle_addr(&self, payload: AddrPayload) -> Result<()> {
        for addr in payload.addr_list {
            if addr != self.node_addr() {
                self.known_nodes.add_node(&addr);
            }
        }
        info!("There are {} known nodes now", self.known_nodes.len());

        for peer in self.peers() {
            if let Err(e) = self.send_get_blocks(&peer) {
                warn!("Failed to request blocks from {peer}: {e}");
            }
        }
        Ok(())
    }

    fn handle_get_blocks(&self, payload: GetBlocksPayload) -> Result<()> {
        let hashes = self.blockchain.get_block_hashes()?;
        self.send_inv(&payload.addr_from, OpType::Block, &hashes)
    }

    fn handle_inv(&self, payload: InvPayload) -> Result<()> {
        let InvPayload {
            addr_from,
            op_type,
            items,
        } = payload;
        info!("Received inventory with {} {op_type:?} items", items.len());

        match op_type {
            OpType::Block => {
                let mut missing = vec![];
                for hash in items {
                    if !self.blockchain.has_block(&hash)? {
                        missing.push(hash);
                    }
                }
                // Nothing new: keep any download already under way.
                if missing.is_empty() {
                    return Ok(());
                }
                self.blocks_in_transit.replace(&missing);
                if let Some(block_hash) = self.blocks_in_transit.pop_first() {
                    self.send_get_data(&addr_from, OpType::Block, &block_hash)?;
                }
            }
            OpType::Tx => {
                for txid in items {
                    if !self.memory_pool.contains(&HEXLOWER.encode(&txid)) {
                        self.send_get_data(&addr_from, OpType::Tx, &txid)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_get_data(&self, payload: GetDataPayload) -> Result<()> {
        let GetDataPayload {
            addr_from,
            op_type,
            id,
        } = payload;
        match op_type {
            OpType::Block => match self.blockchain.get_block(&id) {
                Ok(block) => self.send_block(&addr_from, &block)?,
                Err(e) if e.is_not_found() => {
                    debug!("Peer {addr_from} asked for unknown block {}", HEXLOWER.encode(&id))
                }
                Err(e) => return Err(e),
            },
            OpType::Tx => {
                if let Some(tx) = self.memory_pool.get(&HEXLOWER.encode(&id)) {
                    self.send_tx(&addr_from, &tx)?;
                }
            }
        }
        Ok(())
    }

    fn handle_block(&self, payload: BlockPayload) -> Result<()> {
        let block = Block::deserialize(&payload.block)?;
        info!("Received block {}", block.get_hash_hex());
        // It may have come in unrequested; never ask for it again.
        self.blocks_in_transit.remove(block.get_hash());

        match self.accept_block(block) {
            Ok(stored) if self.config.is_central_node() && !stored.is_empty() => {
                for peer in self.peers() {
                    if peer != payload.addr_from {
                        if let Err(e) = self.send_inv(&peer, OpType::Block, &stored) {
                            warn!("Failed to relay blocks to {peer}: {e}");
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Rejected block from {}: {e}", payload.addr_from),
        }

        if let Some(block_hash) = self.blocks_in_transit.pop_first() {
            self.send_get_data(&payload.addr_from, OpType::Block, &block_hash)?;
        } else {
            UTXOSet::new(self.blockchain.clone()).reindex()?;
        }
        Ok(())
    }

    /// Store `block`, or hold it back until its parent shows up. Returns the
    /// hashes of every block that got stored, including buffered children
    /// the block unlocked.
    fn accept_block(&self, block: Block) -> Result<Vec<Vec<u8>>> {
        if !block.is_genesis() {
            // The parent check and the insert happen under the same lock
            // that parents take after being stored.
            let mut orphans = self.lock_orphans();
            if !self.blockchain.has_block(block.get_pre_block_hash())? {
                info!(
                    "Holding block {} until its parent {} arrives",
                    block.get_hash_hex(),
                    HEXLOWER.encode(block.get_pre_block_hash())
                );
                orphans.insert(block, Instant::now());
                return Ok(vec![]);
            }
        }

        let mut stored = vec![];
        let mut pending = vec![block];
        while let Some(block) = pending.pop() {
            if self.blockchain.add_block(&block)? {
                for tx in block.get_transactions() {
                    self.memory_pool.remove(&HEXLOWER.encode(tx.get_id()));
                }
                stored.push(block.get_hash().to_vec());
            }
            pending.extend(self.lock_orphans().take_children(block.get_hash()));
        }
        Ok(stored)
    }

    fn handle_tx(&self, payload: TxPayload) -> Result<()> {
        let tx = Transaction::deserialize(&payload.transaction)?;
        let txid = tx.get_id().to_vec();
        let txid_hex = HEXLOWER.encode(&txid);

        if tx.is_coinbase() {
            warn!("Dropping coinbase transaction {txid_hex} sent by {}", payload.addr_from);
            return Ok(());
        }
        if self.blockchain.find_transaction(&txid)?.is_some() {
            debug!("Transaction {txid_hex} is already on chain");
            return Ok(());
        }
        if !self.memory_pool.add(tx) {
            debug!("Transaction {txid_hex} is already in the memory pool");
            return Ok(());
        }
        info!(
            "Added transaction {txid_hex} to the memory pool ({} pending)",
            self.memory_pool.len()
        );

        if self.config.is_central_node() {
            for peer in self.peers() {
                if peer != payload.addr_from {
                    if let Err(e) = self.send_inv(&peer, OpType::Tx, &[txid.clone()]) {
                        warn!("Failed to relay transaction to {peer}: {e}");
                    }
                }
            }
        } else if self.config.is_miner()
            && self.memory_pool.len() >= self.config.get_transaction_threshold()
        {
            self.mine_pending()?;
        }
        Ok(())
    }

    /// Mine blocks out of the memory pool until it is drained. Only one
    /// mining run is active per node; concurrent triggers return at once.
    fn mine_pending(&self) -> Result<()> {
        let Some(mining_addr) = self.config.get_mining_addr() else {
            return Ok(());
        };
        let _guard = match self.mining.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("Mining already in progress");
                return Ok(());
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let utxo_set = UTXOSet::new(self.blockchain.clone());
        while !self.memory_pool.is_empty() && !self.is_shutting_down() {
            let mut txs = self.select_transactions(&utxo_set)?;
            if txs.is_empty() {
                info!("All transactions are invalid! Waiting for new ones...");
                return Ok(());
            }
            txs.push(Transaction::new_coinbase_tx(mining_addr, "")?);

            let new_block = self
                .blockchain
                .mine_block_with_signal(&txs, &self.shutdown)?;
            utxo_set.reindex()?;
            for tx in &txs {
                self.memory_pool.remove(&HEXLOWER.encode(tx.get_id()));
            }
            info!("New block {} is mined!", new_block.get_hash_hex());

            for peer in self.peers() {
                if let Err(e) =
                    self.send_inv(&peer, OpType::Block, &[new_block.get_hash().to_vec()])
                {
                    warn!("Failed to announce block to {peer}: {e}");
                }
            }
        }
        Ok(())
    }

    // Pooled transactions that verify against the chain, spend indexed
    // outputs and do not conflict with each other. Everything else is
    // evicted so the pool cannot stall the miner.
    fn select_transactions(&self, utxo_set: &UTXOSet) -> Result<Vec<Transaction>> {
        let mut selected = vec![];
        let mut claimed: HashSet<(Vec<u8>, usize)> = HashSet::new();

        for tx in self.memory_pool.get_all() {
            let txid_hex = HEXLOWER.encode(tx.get_id());
            let verified = match self.blockchain.verify_transaction(&tx) {
                Ok(verified) => verified,
                Err(e) => {
                    warn!("Cannot verify transaction {txid_hex}: {e}");
                    false
                }
            };

            let mut spendable = verified;
            if verified {
                for vin in tx.get_vin() {
                    let outpoint = (vin.get_txid().to_vec(), vin.get_vout());
                    if claimed.contains(&outpoint)
                        || !utxo_set.is_unspent(vin.get_txid(), vin.get_vout())?
                    {
                        spendable = false;
                        break;
                    }
                }
            }

            if spendable {
                claimed.extend(
                    tx.get_vin()
                        .iter()
                        .map(|vin| (vin.get_txid().to_vec(), vin.get_vout())),
                );
                selected.push(tx);
            } else {
                warn!("Evicting transaction {txid_hex} from the memory pool");
                self.memory_pool.remove(&txid_hex);
            }
        }
        Ok(selected)
    }

    // Deliver one package, forgetting the peer if it cannot be reached.
    fn send_package(&self, addr: &str, package: &Package) -> Result<()> {
        let bytes = package.encode()?;
        debug!("Sending {} to {addr}", package.command());
        if let Err(e) = send_data(addr, &bytes) {
            warn!("Peer {addr} is not available, removing it from known nodes: {e}");
            self.known_nodes.evict_node(addr);
            return Err(e);
        }
        Ok(())
    }

    fn send_version(&self, addr: &str) -> Result<()> {
        let best_height = self.blockchain.get_best_height()?;
        self.send_package(
            addr,
            &Package::Version(VersionPayload {
                version: NODE_VERSION,
                best_height,
                addr_from: self.node_addr().to_string(),
            }),
        )
    }

    fn send_addr(&self, addr: &str) -> Result<()> {
        let addr_list = self
            .known_nodes
            .get_addrs()
            .into_iter()
            .filter(|known| known != addr)
            .collect();
        self.send_package(addr, &Package::Addr(AddrPayload { addr_list }))
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        self.send_package(
            addr,
            &Package::GetBlocks(GetBlocksPayload {
                addr_from: self.node_addr().to_string(),
            }),
        )
    }

    fn send_get_data(&self, addr: &str, op_type: OpType, id: &[u8]) -> Result<()> {
        self.send_package(
            addr,
            &Package::GetData(GetDataPayload {
                addr_from: self.node_addr().to_string(),
                op_type,
                id: id.to_vec(),
            }),
        )
    }

    fn send_inv(&self, addr: &str, op_type: OpType, items: &[Vec<u8>]) -> Result<()> {
        self.send_package(
            addr,
            &Package::Inv(InvPayload {
                addr_from: self.node_addr().to_string(),
                op_type,
                items: items.to_vec(),
            }),
        )
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        self.send_package(
            addr,
            &Package::Block(BlockPayload {
                addr_from: self.node_addr().to_string(),
                block: block.serialize()?,
            }),
        )
    }

    fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<()> {
        self.send_package(
            addr,
            &Package::Tx(TxPayload {
                addr_from: self.node_addr().to_string(),
                transaction: tx.serialize()?,
            }),
        )
    }
}

/// A node bound to its listening address, ready to serve.
pub struct Server {
    listener: TcpListener,
    state: Arc<NodeState>,
}

impl Server {
    /// Bind the node's address. Port 0 picks a free port; the node then
    /// advertises the port it actually got.
    pub fn bind(mut config: Config, blockchain: Blockchain) -> Result<Server> {
        let listener = TcpListener::bind(config.get_node_addr()).map_err(|e| {
            BlockchainError::Network(format!("Failed to bind to {}: {e}", config.get_node_addr()))
        })?;
        let local_addr = listener.local_addr()?;
        if config.get_node_addr() != local_addr.to_string() {
            let requested: Option<SocketAddr> = config.get_node_addr().parse().ok();
            if requested.is_some_and(|addr| addr.port() == 0) {
                config.set_node_addr(local_addr.to_string());
            }
        }

        Ok(Server {
            listener,
            state: Arc::new(NodeState::new(config, blockchain)),
        })
    }

    pub fn get_node_addr(&self) -> &str {
        self.state.node_addr()
    }

    pub fn get_state(&self) -> Arc<NodeState> {
        Arc::clone(&self.state)
    }

    /// Announce this node to the central node, then serve connections until
    /// shutdown, one thread per connection.
    pub fn run(self) -> Result<()> {
        let addr = self.state.node_addr().to_string();
        info!("Server listening on {addr}");

        if !self.state.config.is_central_node() {
            let central_node = self.state.config.get_central_node().to_string();
            if let Err(e) = self.state.send_version(&central_node) {
                warn!("Could not reach central node {central_node}: {e}");
            }
        }

        for stream in self.listener.incoming() {
            if self.state.is_shutting_down() {
                break;
            }
            match stream {
                Ok(stream) => {
                    let state = Arc::clone(&self.state);
                    thread::spawn(move || {
                        if let Err(e) = state.handle_connection(stream) {
                            error!("Error handling connection: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }

        info!("Server on {addr} stopped");
        Ok(())
    }

    /// Run the server on a background thread.
    pub fn spawn(self) -> ServerHandle {
        let state = self.get_state();
        let join = thread::spawn(move || self.run());
        ServerHandle { state, join }
    }
}

pub struct ServerHandle {
    state: Arc<NodeState>,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn get_state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn get_node_addr(&self) -> &str {
        self.state.node_addr()
    }

    /// Stop accepting connections and abandon any mining in progress.
    pub fn shutdown(self) -> Result<()> {
        self.state.shutdown.store(true, Ordering::SeqCst);
        // The accept loop only notices the flag once a connection arrives.
        let _ = TcpStream::connect(self.state.node_addr());
        self.join
            .join()
            .map_err(|_| BlockchainError::Network("Server thread panicked".to_string()))?
    }
}

/// Read one message to EOF. `None` when the peer sends more than `limit`
/// bytes.
fn read_message<R: Read>(reader: R, limit: u64) -> Result<Option<Vec<u8>>> {
    let mut request = vec![];
    reader.take(limit + 1).read_to_end(&mut request)?;
    if request.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(request))
}

fn send_data(addr: &str, bytes: &[u8]) -> Result<()> {
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("Address {addr} did not resolve")))?;

    let mut stream = TcpStream::connect_timeout(&socket_addr, TCP_WRITE_TIMEOUT)
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream
        .set_write_timeout(Some(TCP_WRITE_TIMEOUT))
        .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;
    stream
        .write_all(bytes)
        .map_err(|e| BlockchainError::Network(format!("Failed to send data: {e}")))?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

/// Hand a transaction to the node at `addr` without running a node.
pub fn send_tx(addr: &str, addr_from: &str, tx: &Transaction) -> Result<()> {
    let package = Package::Tx(TxPayload {
        addr_from: addr_from.to_string(),
        transaction: tx.serialize()?,
    });
    send_data(addr, &package.encode()?)
}
