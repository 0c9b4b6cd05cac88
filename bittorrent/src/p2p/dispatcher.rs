use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use crate::p2p::loop_control::LoopControl;
use crate::p2p::message::Message;
use crate::p2p::pool::PeerConnectionPool;
use crate::p2p::registry::TorrentRegistry;
use crate::Peer;

pub type Consumer = Arc<dyn Fn(Message) + Send + Sync>;
pub type Supplier = Arc<dyn Fn() -> Option<Message> + Send + Sync>;

/// Single-threaded cooperative scheduler over every live peer connection: it
/// fans inbound messages out to registered consumers and posts whatever
/// registered suppliers produce, driving [`LoopControl`]'s adaptive backoff
/// between iterations that move nothing.
pub struct MessageDispatcher {
    pool: Arc<dyn PeerConnectionPool>,
    registry: Arc<dyn TorrentRegistry>,
    loop_control: Arc<LoopControl>,
    consumers: RwLock<HashMap<Peer, Vec<Consumer>>>,
    suppliers: RwLock<HashMap<Peer, Vec<Supplier>>>,
    shutdown: Arc<AtomicBool>,
}

impl MessageDispatcher {
    pub fn new(
        pool: Arc<dyn PeerConnectionPool>,
        registry: Arc<dyn TorrentRegistry>,
        loop_control: Arc<LoopControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            loop_control,
            consumers: RwLock::new(HashMap::new()),
            suppliers: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers `consumer` to receive every message decoded from `peer` from
    /// this call onward. Safe to call from any thread while the loop runs.
    pub fn add_consumer(&self, peer: Peer, consumer: Consumer) {
        self.consumers.write().unwrap().entry(peer).or_default().push(consumer);
    }

    /// Registers `supplier` to be polled once per iteration while `peer` is connected.
    pub fn add_supplier(&self, peer: Peer, supplier: Supplier) {
        self.suppliers.write().unwrap().entry(peer).or_default().push(supplier);
    }

    /// Spawns the dedicated dispatch loop thread. Intended to be bound to the
    /// "startup" lifecycle hook.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        std::thread::Builder::new()
            .name("message-dispatcher".into())
            .spawn(move || dispatcher.run())
            .expect("failed to spawn dispatcher thread")
    }

    /// Sets the shutdown flag and wakes any in-progress backoff sleep.
    /// Intended to be bound to the "shutdown" lifecycle hook.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.loop_control.wake();
    }

    fn run(&self) {
        tracing::info!("message dispatcher loop starting");
        while !self.shutdown.load(Ordering::SeqCst) {
            self.inbound_phase();
            self.outbound_phase();
            if let Err(e) = self.loop_control.iteration_finished() {
                tracing::error!("dispatch loop sleep failed: {}", e);
                break;
            }
        }
        tracing::info!("message dispatcher loop stopped");
    }

    fn inbound_phase(&self) {
        let snapshot: Vec<(Peer, Vec<Consumer>)> = self
            .consumers
            .read()
            .unwrap()
            .iter()
            .map(|(peer, cs)| (*peer, cs.clone()))
            .collect();

        for (peer, consumers) in snapshot {
            let Some(connection) = self.pool.get_connection(&peer) else {
                continue;
            };
            if connection.is_closed() {
                continue;
            }
            if !self.registry.is_supported_and_active(connection.torrent_id()) {
                continue;
            }

            loop {
                match connection.read_message_now() {
                    Ok(Some(message)) => {
                        self.loop_control.increment_processed();
                        for consumer in &consumers {
                            let consumer = Arc::clone(consumer);
                            let message = clone_message(&message);
                            let result = catch_unwind(AssertUnwindSafe(|| consumer(message)));
                            if result.is_err() {
                                tracing::warn!("consumer for peer {} panicked handling a message", peer);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("failed reading from peer {}: {}", peer, e);
                        break;
                    }
                }
            }
        }
    }

    fn outbound_phase(&self) {
        let snapshot: Vec<(Peer, Vec<Supplier>)> = self
            .suppliers
            .read()
            .unwrap()
            .iter()
            .map(|(peer, ss)| (*peer, ss.clone()))
            .collect();

        for (peer, suppliers) in snapshot {
            let Some(connection) = self.pool.get_connection(&peer) else {
                continue;
            };
            if connection.is_closed() {
                continue;
            }
            if !self.registry.is_supported_and_active(connection.torrent_id()) {
                continue;
            }

            for supplier in &suppliers {
                let supplier = Arc::clone(supplier);
                let produced = catch_unwind(AssertUnwindSafe(|| supplier()));
                let message = match produced {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(_) => {
                        tracing::warn!("supplier for peer {} panicked", peer);
                        continue;
                    }
                };

                self.loop_control.increment_processed();
                if let Err(e) = connection.post_message(message) {
                    tracing::error!("failed posting to peer {}: {}", peer, e);
                }
            }
        }
    }
}

/// Messages are not `Clone` in general (the wire codec doesn't need it), but
/// fan-out to multiple consumers needs an owned copy per callback; this
/// mirrors the variants cheaply without requiring a blanket `Clone` impl on
/// the wire type.
fn clone_message(message: &Message) -> Message {
    match message {
        Message::KeepAlive => Message::KeepAlive,
        Message::Choke => Message::Choke,
        Message::Unchoke => Message::Unchoke,
        Message::Interested => Message::Interested,
        Message::NotInterested => Message::NotInterested,
        Message::Have { idx } => Message::Have { idx: *idx },
        Message::Bitfield(bf) => Message::Bitfield(bf.clone()),
        Message::Request(info) => Message::Request(*info),
        Message::Block(data) => Message::Block(data.clone()),
        Message::Cancel(info) => Message::Cancel(*info),
        Message::Port { port } => Message::Port { port: *port },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::connection::fake::FakeConnection;
    use crate::p2p::pool::InMemoryConnectionPool;
    use crate::p2p::registry::InMemoryTorrentRegistry;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn setup() -> (
        Arc<InMemoryConnectionPool>,
        Arc<InMemoryTorrentRegistry>,
        Arc<MessageDispatcher>,
    ) {
        let pool = Arc::new(InMemoryConnectionPool::new());
        let registry = Arc::new(InMemoryTorrentRegistry::new());
        let loop_control = Arc::new(LoopControl::new(Duration::from_millis(8)));
        let dispatcher = MessageDispatcher::new(pool.clone(), registry.clone(), loop_control);
        (pool, registry, dispatcher)
    }

    // S1: fan-out to every registered consumer.
    #[test]
    fn fans_out_to_all_consumers() {
        let (pool, registry, dispatcher) = setup();
        let torrent_id = [1u8; 20];
        registry.activate(torrent_id);

        let peer: Peer = "127.0.0.1:1".parse().unwrap();
        let conn = Arc::new(FakeConnection::new(torrent_id));
        conn.push_inbound(Message::Unchoke);
        conn.push_inbound(Message::Interested);
        pool.add_connection_if_absent(peer, conn);

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let (sa, sb) = (seen_a.clone(), seen_b.clone());
        dispatcher.add_consumer(peer, Arc::new(move |m| sa.lock().unwrap().push(m)));
        dispatcher.add_consumer(peer, Arc::new(move |m| sb.lock().unwrap().push(m)));

        dispatcher.inbound_phase();

        assert_eq!(seen_a.lock().unwrap().len(), 2);
        assert_eq!(seen_b.lock().unwrap().len(), 2);
    }

    // S2: a panicking consumer does not block sibling consumers or later messages.
    #[test]
    fn consumer_panic_is_isolated() {
        let (pool, registry, dispatcher) = setup();
        let torrent_id = [2u8; 20];
        registry.activate(torrent_id);

        let peer: Peer = "127.0.0.1:2".parse().unwrap();
        let conn = Arc::new(FakeConnection::new(torrent_id));
        conn.push_inbound(Message::Unchoke);
        conn.push_inbound(Message::Interested);
        pool.add_connection_if_absent(peer, conn);

        dispatcher.add_consumer(peer, Arc::new(|_m| panic!("boom")));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        dispatcher.add_consumer(peer, Arc::new(move |_m| { seen2.fetch_add(1, Ordering::SeqCst); }));

        dispatcher.inbound_phase();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    // S5: an inactive torrent's connections are skipped entirely.
    #[test]
    fn inactive_torrent_is_skipped() {
        let (pool, registry, dispatcher) = setup();
        let torrent_id = [3u8; 20];
        // Deliberately not activated.

        let peer: Peer = "127.0.0.1:3".parse().unwrap();
        let conn = Arc::new(FakeConnection::new(torrent_id));
        conn.push_inbound(Message::Unchoke);
        pool.add_connection_if_absent(peer, conn);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        dispatcher.add_consumer(peer, Arc::new(move |_m| { seen2.fetch_add(1, Ordering::SeqCst); }));

        dispatcher.inbound_phase();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        let _ = registry;
    }

    // Closed-connection filter.
    #[test]
    fn closed_connection_is_skipped() {
        let (pool, registry, dispatcher) = setup();
        let torrent_id = [4u8; 20];
        registry.activate(torrent_id);

        let peer: Peer = "127.0.0.1:4".parse().unwrap();
        let conn = Arc::new(FakeConnection::new(torrent_id));
        conn.push_inbound(Message::Unchoke);
        conn.close();
        pool.add_connection_if_absent(peer, conn);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        dispatcher.add_consumer(peer, Arc::new(move |_m| { seen2.fetch_add(1, Ordering::SeqCst); }));

        dispatcher.inbound_phase();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    // Outbound phase posts whatever the supplier produces.
    #[test]
    fn outbound_phase_posts_supplied_messages() {
        let (pool, registry, dispatcher) = setup();
        let torrent_id = [5u8; 20];
        registry.activate(torrent_id);

        let peer: Peer = "127.0.0.1:5".parse().unwrap();
        let conn = Arc::new(FakeConnection::new(torrent_id));
        pool.add_connection_if_absent(peer, conn.clone());

        let polled = Arc::new(AtomicUsize::new(0));
        let polled2 = polled.clone();
        dispatcher.add_supplier(peer, Arc::new(move || {
            let n = polled2.fetch_add(1, Ordering::SeqCst);
            if n == 0 { Some(Message::Choke) } else { None }
        }));

        dispatcher.outbound_phase();

        assert_eq!(conn.outbound.lock().unwrap().len(), 1);
    }

    // S6: shutdown wakes an in-progress sleep promptly.
    #[test]
    fn shutdown_wakes_sleep_promptly() {
        let (_pool, _registry, dispatcher) = setup();
        let dispatcher2 = dispatcher.clone();
        let handle = std::thread::spawn(move || dispatcher2.run());

        std::thread::sleep(Duration::from_millis(20));
        let started = std::time::Instant::now();
        dispatcher.shutdown();
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
