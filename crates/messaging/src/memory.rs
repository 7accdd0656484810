use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};

use crate::broker::{
    Acknowledger, Broker, ConnectionEvent, Delivery, DeliveryConsumer, MessageProperties,
    OutboundMessage, PublishTransaction, QueueSpec,
};
use crate::{MessagingError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    consumer: u64,
    message: StoredMessage,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
        }
    }

    /// Returns unacked deliveries to the head of the queue, oldest first.
    fn requeue_where(&mut self, matches: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| matches(unacked))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    connected: bool,
    /// Bumped on every connection loss. Consumers and publish transactions
    /// opened on an older connection stop working.
    generation: u64,
    failing_reconnects: usize,
    failing_publish_commits: usize,
    exchanges: HashSet<String>,
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_consumer: u64,
    published: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connected: true,
            generation: 0,
            failing_reconnects: 0,
            failing_publish_commits: 0,
            exchanges: HashSet::new(),
            bindings: HashMap::new(),
            queues: HashMap::new(),
            next_tag: 0,
            next_consumer: 0,
            published: 0,
        }
    }
}

impl BrokerState {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(MessagingError::BrokerUnavailable(
                "connection is closed".to_string(),
            ))
        }
    }

    fn ensure_exchange(&self, exchange: &str) -> Result<()> {
        if self.exchanges.contains(exchange) {
            Ok(())
        } else {
            Err(MessagingError::TopologyNotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })
        }
    }

    /// Fanout: a copy of the message goes to every bound queue.
    fn route(&mut self, exchange: &str, properties: &MessageProperties, body: &[u8]) {
        let Some(queues) = self.bindings.get(exchange) else {
            return;
        };

        for name in queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(StoredMessage {
                    properties: properties.clone(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    changed: Notify,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory broker implementation for testing.
///
/// Models the RabbitMQ behaviour the messaging layer relies on: durable
/// fanout exchanges, per-consumer prefetch, requeue to the head of the queue
/// with the redelivered flag set, dead-lettering on reject without requeue,
/// and transactional publishing. Connection loss can be simulated; it returns
/// every unacknowledged delivery to its queue like a closed channel does.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
                events,
            }),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the connection as if the broker went away.
    pub fn simulate_connection_loss(&self, reason: impl Into<String>) {
        {
            let mut state = self.shared.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.generation += 1;
            for queue in state.queues.values_mut() {
                queue.requeue_where(|_| true);
            }
        }
        let _ = self.shared.events.send(ConnectionEvent::Lost(reason.into()));
        self.shared.changed.notify_waiters();
    }

    /// Makes the next `count` reconnect attempts fail.
    pub fn fail_next_reconnects(&self, count: usize) {
        self.shared.lock().failing_reconnects = count;
    }

    /// Makes the next `count` publish transaction commits fail.
    pub fn fail_next_publish_commits(&self, count: usize) {
        self.shared.lock().failing_publish_commits = count;
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.lock().exchanges.contains(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.lock().queues.contains_key(name)
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.shared
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.spec.clone())
    }

    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        self.shared
            .lock()
            .bindings
            .get(exchange)
            .is_some_and(|queues| queues.iter().any(|bound| bound == queue))
    }

    /// Number of messages waiting in a queue, excluding unacknowledged ones.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.ready.len())
    }

    pub fn unacked_count(&self, name: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.unacked.len())
    }

    /// Returns copies of the messages waiting in a queue, head first.
    pub fn peek_messages(&self, name: &str) -> Vec<OutboundMessage> {
        self.shared
            .lock()
            .queues
            .get(name)
            .map(|queue| {
                queue
                    .ready
                    .iter()
                    .map(|message| OutboundMessage {
                        properties: message.properties.clone(),
                        body: message.body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages accepted by exchanges, counting a committed
    /// transaction once per message.
    pub fn published_count(&self) -> usize {
        self.shared.lock().published
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str, passive: bool) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_connected()?;
        if passive {
            return state.ensure_exchange(name);
        }
        state.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_connected()?;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(MessagingError::PreconditionFailed(
                format!("queue {} already declared with different arguments", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_connected()?;
        state.ensure_exchange(exchange)?;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::TopologyNotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }

        let bound = state.bindings.entry(exchange.to_string()).or_default();
        if !bound.iter().any(|existing| existing == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.ensure_connected()?;
            state.ensure_exchange(exchange)?;
            state.route(exchange, &message.properties, &message.body);
            state.published += 1;
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn begin_publish(&self) -> Result<Box<dyn PublishTransaction>> {
        let state = self.shared.lock();
        state.ensure_connected()?;
        Ok(Box::new(InMemoryPublishTransaction {
            shared: Arc::clone(&self.shared),
            generation: state.generation,
            pending: Vec::new(),
        }))
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn DeliveryConsumer>> {
        let mut state = self.shared.lock();
        state.ensure_connected()?;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::TopologyNotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        state.next_consumer += 1;

        Ok(Box::new(InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            id: state.next_consumer,
            prefetch,
            generation: state.generation,
            cancelled: false,
        }))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    async fn reconnect(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.connected {
            return Ok(());
        }
        if state.failing_reconnects > 0 {
            state.failing_reconnects -= 1;
            return Err(MessagingError::BrokerUnavailable(
                "connection refused".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }
}

struct InMemoryPublishTransaction {
    shared: Arc<Shared>,
    generation: u64,
    pending: Vec<(String, OutboundMessage)>,
}

impl InMemoryPublishTransaction {
    fn ensure_open(&self, state: &BrokerState) -> Result<()> {
        state.ensure_connected()?;
        if state.generation != self.generation {
            return Err(MessagingError::BrokerUnavailable(
                "publish channel was closed".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PublishTransaction for InMemoryPublishTransaction {
    async fn publish(&mut self, exchange: &str, message: OutboundMessage) -> Result<()> {
        {
            let state = self.shared.lock();
            self.ensure_open(&state)?;
            state.ensure_exchange(exchange)?;
        }
        self.pending.push((exchange.to_string(), message));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;
            if state.failing_publish_commits > 0 {
                state.failing_publish_commits -= 1;
                return Err(MessagingError::BrokerUnavailable(
                    "transaction commit failed".to_string(),
                ));
            }
            for (exchange, message) in &self.pending {
                state.route(exchange, &message.properties, &message.body);
            }
            state.published += self.pending.len();
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
    prefetch: u16,
    generation: u64,
    cancelled: bool,
}

impl InMemoryConsumer {
    fn release(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        {
            let mut state = self.shared.lock();
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                let id = self.id;
                queue.requeue_where(|unacked| unacked.consumer == id);
            }
        }
        self.shared.changed.notify_waiters();
    }
}

#[async_trait]
impl DeliveryConsumer for InMemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut guard = self.shared.lock();
                let state = &mut *guard;
                if self.cancelled || !state.connected || state.generation != self.generation {
                    return None;
                }

                let Some(queue) = state.queues.get_mut(&self.queue) else {
                    return Some(Err(MessagingError::TopologyNotFound {
                        kind: "queue",
                        name: self.queue.clone(),
                    }));
                };

                let in_flight = queue
                    .unacked
                    .values()
                    .filter(|unacked| unacked.consumer == self.id)
                    .count();
                let has_room = self.prefetch == 0 || in_flight < usize::from(self.prefetch);

                if let Some(message) = has_room.then(|| queue.ready.pop_front()).flatten() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    queue.unacked.insert(
                        tag,
                        Unacked {
                            consumer: self.id,
                            message: message.clone(),
                        },
                    );

                    let acker = InMemoryAcker {
                        shared: Arc::clone(&self.shared),
                        queue: self.queue.clone(),
                        tag,
                    };
                    return Some(Ok(Delivery::new(
                        message.properties,
                        message.body,
                        message.redelivered,
                        Box::new(acker),
                    )));
                }
            }

            changed.await;
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.ensure_connected()?;

            let unacked = state
                .queues
                .get_mut(&self.queue)
                .and_then(|queue| queue.unacked.remove(&self.tag))
                .ok_or_else(|| {
                    MessagingError::PreconditionFailed(format!(
                        "unknown delivery tag {} on {}",
                        self.tag, self.queue
                    ))
                })?;

            match requeue {
                None => {}
                Some(true) => {
                    if let Some(queue) = state.queues.get_mut(&self.queue) {
                        let mut message = unacked.message;
                        message.redelivered = true;
                        queue.ready.push_front(message);
                    }
                }
                Some(false) => {
                    let dead_letter_exchange = state
                        .queues
                        .get(&self.queue)
                        .and_then(|queue| queue.spec.dead_letter_exchange.clone());
                    if let Some(exchange) = dead_letter_exchange {
                        let message = unacked.message;
                        state.route(&exchange, &message.properties, &message.body);
                    }
                }
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}
