use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mdns_cache::{CacheEvent, CacheService};
use mdns_proto::{Entry, Message, Question, RecordData, RecordType};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::conflict::{handle_address, handle_host_information, handle_service, Verdict};
use crate::descriptor::{rename_service_instance, HostDescriptor, ServiceDescriptor};
use crate::error::EngineError;
use crate::socket::{multicast_address, now_ms, Datagram, Socket};
use crate::state::State;

/// A name this host owns and can be asked to probe, announce, or cancel:
/// either the host's own `.local` identity or one registered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Host,
    Service(String),
}

/// A discovery notification delivered to a [`Engine::browse`] subscriber:
/// a service instance appeared (via PTR insert/refresh) or disappeared
/// (via goodbye / cache expiry).
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub qualified_name: String,
    pub removed: bool,
}

const MAX_FRAGMENT_AGE: Duration = Duration::from_millis(400);

/// The DNS-SD meta-query name (RFC 6763 §9): a PTR query against this name
/// enumerates registered service *types* rather than instances of one type.
pub const META_QUERY_NAME: &str = "_services._dns-sd._udp.local.";

/// Which call site observed a conflict. Only the probe/authority-section
/// path (`handle_query`) ever cascades a revert to every owned service;
/// a conflict seen in a response only ever reverts the name it's about
/// (RFC 6762 §9.2's "defend the name" vs. probe-loss distinction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictSource {
    Probe,
    Response,
}

/// Tunables that used to be hardcoded constants: the sender UDP payload
/// size budget and the cache reaper's sweep interval, both now sourced from
/// the root crate's `Config` rather than baked into the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_payload: usize,
    pub reap_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payload: mdns_proto::buffer::DEFAULT_PAYLOAD_SIZE,
            reap_interval: crate::scheduler::reaper_interval(),
        }
    }
}

/// Ties the cache, transport, and owned-name registry together and applies
/// RFC 6762 conflict semantics to everything that comes off the wire.
///
/// Mutations to `host` and `services` are guarded by their own locks rather
/// than one engine-wide lock on `self`, so a listener fired while iterating
/// the service map can still read `host` without deadlocking. `self_handle`
/// is the opaque back-reference the design notes call for: scheduler tasks
/// need an `Arc<Engine>` to keep themselves alive, and this is how a `&self`
/// method (reached through a plain `&Engine` call) obtains one without the
/// caller needing to thread an `Arc` through every entry point.
pub struct Engine {
    cache: Arc<dyn CacheService>,
    socket: Arc<dyn Socket>,
    host: Mutex<HostDescriptor>,
    services: RwLock<HashMap<String, ServiceDescriptor>>,
    known_types: RwLock<std::collections::HashSet<String>>,
    pending: Mutex<HashMap<SocketAddr, (Message, Instant)>>,
    self_handle: Weak<Engine>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(host_name: impl Into<String>, cache: Arc<dyn CacheService>, socket: Arc<dyn Socket>) -> Arc<Self> {
        Self::with_config(host_name, cache, socket, EngineConfig::default())
    }

    pub fn with_config(
        host_name: impl Into<String>,
        cache: Arc<dyn CacheService>,
        socket: Arc<dyn Socket>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let host_name = host_name.into();
        Arc::new_cyclic(|weak| Self {
            cache,
            socket,
            host: Mutex::new(HostDescriptor::new(host_name)),
            services: RwLock::new(HashMap::new()),
            known_types: RwLock::new(std::collections::HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            self_handle: weak.clone(),
            config,
        })
    }

    fn handle(&self) -> Option<Arc<Self>> {
        self.self_handle.upgrade()
    }

    pub async fn set_host_address(&self, address: IpAddr) {
        self.host.lock().await.address = Some(address);
    }

    /// Starts the reader loop, cache reaper, and the host's own prober —
    /// the three tasks that run unconditionally for the lifetime of the
    /// engine. Registered services start their own [`crate::tasks::Prober`]
    /// from [`Engine::register_service`].
    pub fn start(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let reap_interval = self.config.reap_interval;
        vec![
            crate::scheduler::spawn(Box::new(crate::tasks::Prober::new(self.clone(), Owner::Host))),
            self.clone().spawn_reaper(reap_interval),
            tokio::spawn(self.run_reader_loop()),
        ]
    }

    pub async fn register_service(&self, descriptor: ServiceDescriptor) {
        let key = descriptor.qualified_name();
        tracing::debug!(name = %key, "registering service");
        self.register_service_type(&descriptor.service_type).await;
        self.services.write().await.insert(key.clone(), descriptor);
        if let Some(engine) = self.handle() {
            crate::scheduler::spawn(Box::new(crate::tasks::Prober::new(engine, Owner::Service(key))));
        }
    }

    /// Advertises interest in `service_type` for meta-query purposes (§6):
    /// the host will answer `_services._dns-sd._udp.local` PTR queries with
    /// this type from the moment this is called, even before an instance of
    /// it is registered. [`Engine::register_service`] calls this itself, so
    /// a caller only needs it directly to advertise a type ahead of time.
    pub async fn register_service_type(&self, service_type: &str) {
        self.known_types.write().await.insert(service_type.to_ascii_lowercase());
    }

    pub async fn unregister_service(&self, qualified_name: &str) -> Result<(), EngineError> {
        let key = qualified_name.to_ascii_lowercase();
        {
            let mut services = self.services.write().await;
            match services.get_mut(&key) {
                Some(descriptor) => descriptor.state.cancel(),
                None => return Err(EngineError::IllegalState),
            }
        }
        if let Some(engine) = self.handle() {
            crate::scheduler::spawn(Box::new(crate::tasks::Canceler::new(engine, Owner::Service(key))));
        }
        Ok(())
    }

    pub async fn unregister_all(&self) {
        let keys: Vec<String> = {
            let mut services = self.services.write().await;
            for descriptor in services.values_mut() {
                descriptor.state.cancel();
            }
            services.keys().cloned().collect()
        };
        if let Some(engine) = self.handle() {
            for key in keys {
                crate::scheduler::spawn(Box::new(crate::tasks::Canceler::new(engine.clone(), Owner::Service(key))));
            }
        }
    }

    /// Sets a service's TXT record, re-entering ANNOUNCING if the service
    /// was already ANNOUNCED — the double-checked transition the design
    /// notes call for on `needs_text_announcement`.
    pub async fn set_service_text(&self, qualified_name: &str, text: Vec<u8>) -> Result<(), EngineError> {
        let key = qualified_name.to_ascii_lowercase();
        let mut services = self.services.write().await;
        let descriptor = services.get_mut(&key).ok_or(EngineError::IllegalState)?;
        if descriptor.state.current().is_canceled() {
            return Err(EngineError::IllegalState);
        }
        descriptor.set_text(text);
        let needs_announce = descriptor.needs_text_announcement;
        if needs_announce {
            descriptor.state.restart_announcing();
        }
        drop(services);

        if needs_announce {
            if let Some(engine) = self.handle() {
                crate::scheduler::spawn(Box::new(crate::tasks::Announcer::new(engine, Owner::Service(key))));
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.host.lock().await.state.cancel();
        self.unregister_all().await;
        if let Err(err) = self.send_goodbye(&Owner::Host).await {
            tracing::warn!(%err, "host goodbye send failed");
        }
        self.socket.close().await;
    }

    pub async fn services_of_type(&self, service_type: &str) -> Vec<ServiceDescriptor> {
        let service_type = service_type.to_ascii_lowercase();
        self.services
            .read()
            .await
            .values()
            .filter(|d| d.service_type.eq_ignore_ascii_case(&service_type))
            .cloned()
            .collect()
    }

    pub async fn service_info(&self, qualified_name: &str) -> Option<ServiceDescriptor> {
        self.services.read().await.get(&qualified_name.to_ascii_lowercase()).cloned()
    }

    /// Builds a [`ServiceDescriptor`] for a remote instance out of whatever
    /// the cache currently holds (SRV, TXT, and the target's address),
    /// falling back to a registered descriptor of our own. Returns a
    /// descriptor with `has_data() == false` if SRV hasn't arrived yet.
    pub async fn resolve_from_cache(&self, qualified_name: &str) -> Option<ServiceDescriptor> {
        let key = qualified_name.to_ascii_lowercase();
        if let Some(descriptor) = self.services.read().await.get(&key).cloned() {
            return Some(descriptor);
        }

        let srv = self.cache.get(&key, RecordType::Srv).await.into_iter().next()?;
        let (priority, weight, port, target) = match srv.data {
            RecordData::Service { priority, weight, port, target } => (priority, weight, port, target),
            _ => return None,
        };

        let (instance, service_type) = key.split_once('.').unwrap_or((key.as_str(), ""));
        let mut descriptor = ServiceDescriptor::new(service_type, instance, target.clone(), port);
        descriptor.priority = priority;
        descriptor.weight = weight;

        if let Some(text_entry) = self.cache.get(&key, RecordType::Txt).await.into_iter().next() {
            if let RecordData::Text(bytes) = text_entry.data {
                descriptor.text = bytes;
            }
        }

        for record_type in [RecordType::A, RecordType::AAAA] {
            if let Some(address_entry) = self.cache.get(&target, record_type).await.into_iter().next() {
                if let RecordData::Address(address) = address_entry.data {
                    descriptor.address = Some(address);
                    break;
                }
            }
        }

        descriptor.state.cancel();
        // Discovered descriptors don't run the local probe/announce
        // lifecycle; CANCELED here just means "not one of ours", read only
        // through `has_data()`/fields, never re-armed by a task.
        Some(descriptor)
    }

    /// Subscribes to PTR insert/expiry events for `service_type`, and kicks
    /// off the [`crate::tasks::Resolver`] backoff (ServiceResolver +
    /// TypeResolver) that actively queries for it.
    pub fn browse(self: Arc<Self>, service_type: &str) -> UnboundedReceiver<ServiceEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (cache_tx, mut cache_rx) = tokio::sync::mpsc::unbounded_channel::<CacheEvent>();
        let cache = self.cache.clone();
        let service_type_owned = service_type.to_ascii_lowercase();
        tokio::spawn(async move {
            cache.add_listener(&service_type_owned, RecordType::Ptr, cache_tx).await;
        });
        tokio::spawn(async move {
            while let Some(event) = cache_rx.recv().await {
                let (entry, removed) = match event {
                    CacheEvent::Inserted(entry) | CacheEvent::Updated(entry) => (entry, false),
                    CacheEvent::Expired(entry) => (entry, true),
                };
                if let RecordData::Pointer(name) = entry.data {
                    if tx.send(ServiceEvent { qualified_name: name, removed }).is_err() {
                        break;
                    }
                }
            }
        });

        crate::scheduler::spawn(crate::tasks::service_resolver(self.clone(), service_type));
        crate::scheduler::spawn(crate::tasks::type_resolver(self.clone()));
        rx
    }

    /// Subscribes to the DNS-SD meta-query instead of one service type:
    /// arms the [`crate::tasks::type_resolver`] backoff and surfaces every
    /// distinct service type this host observes (appear/disappear), the
    /// add/remove service-type listener operation of §6. `browse` remains
    /// the per-type instance listener; this is its type-level counterpart.
    pub fn browse_types(self: Arc<Self>) -> UnboundedReceiver<ServiceEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (cache_tx, mut cache_rx) = tokio::sync::mpsc::unbounded_channel::<CacheEvent>();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            cache.add_listener(META_QUERY_NAME, RecordType::Ptr, cache_tx).await;
        });
        tokio::spawn(async move {
            while let Some(event) = cache_rx.recv().await {
                let (entry, removed) = match event {
                    CacheEvent::Inserted(entry) | CacheEvent::Updated(entry) => (entry, false),
                    CacheEvent::Expired(entry) => (entry, true),
                };
                if let RecordData::Pointer(service_type) = entry.data {
                    if tx.send(ServiceEvent { qualified_name: service_type, removed }).is_err() {
                        break;
                    }
                }
            }
        });

        crate::scheduler::spawn(crate::tasks::type_resolver(self));
        rx
    }

    /// Resolves a specific instance to SRV+TXT+address, blocking (via a
    /// polling wait — the async analogue of the spec's condition-variable
    /// wait) until `has_data()` or `timeout` elapses.
    pub async fn request_service_info(self: Arc<Self>, qualified_name: &str, timeout: Duration) -> Option<ServiceDescriptor> {
        let key = qualified_name.to_ascii_lowercase();
        if let Some(descriptor) = self.resolve_from_cache(&key).await {
            if descriptor.has_data() {
                return Some(descriptor);
            }
        }

        crate::scheduler::spawn(crate::tasks::info_resolver(self.clone(), &key));

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(descriptor) = self.resolve_from_cache(&key).await {
                if descriptor.has_data() {
                    return Some(descriptor);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50).min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    pub fn cache(&self) -> Arc<dyn CacheService> {
        self.cache.clone()
    }

    /// Current state of the host or a named service, or `None` if the
    /// service was never registered — the signal a scheduler task uses to
    /// stop.
    pub async fn owner_state(&self, owner: &Owner) -> Option<State> {
        match owner {
            Owner::Host => Some(self.host.lock().await.state.current()),
            Owner::Service(name) => self.services.read().await.get(name).map(|d| d.state.current()),
        }
    }

    pub async fn advance_owner(&self, owner: &Owner) -> Option<State> {
        match owner {
            Owner::Host => {
                let mut host = self.host.lock().await;
                host.state.advance();
                Some(host.state.current())
            }
            Owner::Service(name) => {
                let mut services = self.services.write().await;
                let descriptor = services.get_mut(name)?;
                descriptor.state.advance();
                Some(descriptor.state.current())
            }
        }
    }

    pub async fn needs_text_announcement(&self, owner: &Owner) -> bool {
        match owner {
            Owner::Host => false,
            Owner::Service(name) => self
                .services
                .read()
                .await
                .get(name)
                .map(|d| d.needs_text_announcement)
                .unwrap_or(false),
        }
    }

    pub async fn clear_text_announcement(&self, owner: &Owner) {
        if let Owner::Service(name) = owner {
            if let Some(descriptor) = self.services.write().await.get_mut(name) {
                descriptor.needs_text_announcement = false;
            }
        }
    }

    /// Drops a service descriptor once its goodbye burst has gone out.
    pub async fn forget_service(&self, name: &str) {
        self.services.write().await.remove(name);
    }

    async fn owner_records(&self, owner: &Owner, ttl: u32) -> Vec<Entry> {
        match owner {
            Owner::Host => {
                let host = self.host.lock().await;
                match host.address {
                    Some(address) => vec![Entry::new(host.name(), ttl, RecordData::Address(address))],
                    None => Vec::new(),
                }
            }
            Owner::Service(name) => match self.services.read().await.get(name).cloned() {
                Some(descriptor) => {
                    let mut records = self.service_records(&descriptor).await;
                    for record in &mut records {
                        record.ttl = ttl;
                    }
                    records
                }
                None => Vec::new(),
            },
        }
    }

    pub async fn send_probe(&self, owner: &Owner) -> Result<(), EngineError> {
        let records = self.owner_records(owner, 120).await;
        if records.is_empty() {
            return Ok(());
        }
        let mut message = Message::query();
        message.authorities = records;
        self.send_message(&message, multicast_address()).await
    }

    pub async fn send_announce(&self, owner: &Owner, ttl: u32) -> Result<(), EngineError> {
        let records = self.owner_records(owner, ttl).await;
        if records.is_empty() {
            return Ok(());
        }
        let mut message = Message::response();
        message.answers = records;
        self.send_message(&message, multicast_address()).await
    }

    pub async fn send_goodbye(&self, owner: &Owner) -> Result<(), EngineError> {
        self.send_announce(owner, 0).await
    }

    pub async fn send_question(&self, question: Question, known_answers: Vec<Entry>) -> Result<(), EngineError> {
        let mut message = Message::query();
        message.questions.push(question);
        message.answers = known_answers;
        self.send_message(&message, multicast_address()).await
    }

    pub async fn send_message(&self, message: &Message, destination: SocketAddr) -> Result<(), EngineError> {
        let bytes = message.write(self.config.max_payload)?;
        self.socket.send(&bytes, destination).await?;
        Ok(())
    }

    /// Sends `response`, splitting its answer set across multiple messages
    /// and setting TC on all but the last when it doesn't fit in one
    /// sender-UDP-payload-size datagram (§4.4).
    pub async fn send_response(&self, mut response: Message, destination: SocketAddr) -> Result<(), EngineError> {
        let answers = std::mem::take(&mut response.answers);
        let batches = self.batch_answers(&response, answers)?;

        let last = batches.len().saturating_sub(1);
        for (index, batch) in batches.into_iter().enumerate() {
            response.answers = batch;
            response.truncated = index != last;
            self.send_message(&response, destination).await?;
        }
        Ok(())
    }

    /// Greedily packs `answers` into the fewest messages that each fit
    /// under `self.config.max_payload` once `template`'s header, questions
    /// and other sections are accounted for.
    fn batch_answers(&self, template: &Message, answers: Vec<Entry>) -> Result<Vec<Vec<Entry>>, EngineError> {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut probe = template.clone();

        for answer in answers {
            let mut candidate = current.clone();
            candidate.push(answer.clone());
            probe.answers = candidate.clone();
            match probe.write(self.config.max_payload) {
                Ok(_) => current = candidate,
                Err(mdns_proto::WriterError::PayloadTooLarge { .. }) if !current.is_empty() => {
                    batches.push(std::mem::replace(&mut current, vec![answer.clone()]));
                    probe.answers = vec![answer];
                    probe.write(self.config.max_payload)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        if !current.is_empty() || batches.is_empty() {
            batches.push(current);
        }
        Ok(batches)
    }

    /// Blocks on the socket forever, handing each datagram to the engine.
    /// Grounded on the teacher's `Receiver`/`Sender` split folded into one
    /// loop since this crate's `Socket` trait already owns both directions.
    /// A recv IoError triggers §7 recovery instead of ending the loop.
    pub async fn run_reader_loop(self: Arc<Self>) {
        loop {
            match self.socket.recv().await {
                Ok(datagram) => {
                    if let Err(err) = self.handle_datagram(datagram).await {
                        tracing::warn!(%err, "dropping malformed datagram");
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "socket recv failed, recovering");
                    self.clone().recover_from_io_error().await;
                }
            }
        }
    }

    /// §7 IoError recovery: clear the cache, revert the host and every
    /// non-canceled service to PROBING_1 and re-probe them, then rebind the
    /// socket. In-flight scheduler tasks observe the reverted state on
    /// their next pass and stop themselves, the same self-cancellation the
    /// rest of the engine relies on instead of an explicit task registry.
    async fn recover_from_io_error(self: Arc<Self>) {
        self.cache.clear().await;

        self.host.lock().await.state.revert();
        crate::scheduler::spawn(Box::new(crate::tasks::Prober::new(self.clone(), Owner::Host)));

        let keys: Vec<String> = {
            let mut services = self.services.write().await;
            services
                .iter_mut()
                .filter(|(_, descriptor)| !descriptor.state.current().is_canceled())
                .map(|(key, descriptor)| {
                    descriptor.state.revert();
                    key.clone()
                })
                .collect()
        };
        for key in keys {
            crate::scheduler::spawn(Box::new(crate::tasks::Prober::new(self.clone(), Owner::Service(key))));
        }

        if let Err(err) = self.socket.rebind().await {
            tracing::error!(%err, "socket rebind failed");
        }
    }

    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let task = crate::scheduler::Periodic {
            interval,
            action: move || {
                let engine = self.clone();
                Box::pin(async move {
                    let now = now_ms();
                    let reaped = engine.cache.reap(now).await;
                    if reaped > 0 {
                        tracing::debug!(reaped, "reaper swept expired records");
                    }
                }) as futures::future::BoxFuture<'static, ()>
            },
            should_stop: || false,
        };
        crate::scheduler::spawn(Box::new(task))
    }

    pub async fn handle_datagram(&self, datagram: Datagram) -> Result<(), EngineError> {
        let message = Message::read(&datagram.bytes, datagram.recv_time_ms)?;
        if message.response {
            self.handle_response(message, datagram.recv_time_ms).await;
        } else {
            self.handle_query(message, datagram.recv_time_ms, datagram.source).await?;
        }
        Ok(())
    }

    async fn handle_response(&self, message: Message, now_ms: u64) {
        for entry in message.answers.into_iter().chain(message.additionals) {
            self.apply_conflict_check(&entry, ConflictSource::Response).await;
            if entry.ttl == 0 {
                tracing::debug!(name = %entry.name, "goodbye record received");
                self.cache.remove(&entry).await;
            } else {
                self.cache.put(entry, now_ms).await;
            }
        }
    }

    async fn apply_conflict_check(&self, observed: &Entry, source: ConflictSource) {
        match observed.record_type() {
            RecordType::A | RecordType::AAAA => {
                let mut host = self.host.lock().await;
                if let Some(address) = host.address {
                    let ours = Entry::new(host.name(), observed.ttl, RecordData::Address(address));
                    if handle_address(&ours, observed) == Verdict::Lose {
                        tracing::warn!(name = %ours.name, "lost address tie-break, renaming host");
                        let was_probing = host.state.current().is_probing();
                        host.rename();
                        // Only the probe/authority-section path cascades a
                        // revert to every owned service (§4.3): a response
                        // observed losing only ever renames/reverts the
                        // host itself, never the services riding on it.
                        if source == ConflictSource::Probe && was_probing {
                            drop(host);
                            self.unregister_all_states_for_revert().await;
                        }
                    }
                }
            }
            RecordType::Srv => {
                let mut services = self.services.write().await;
                if let Some(descriptor) = services.get_mut(&observed.name.to_ascii_lowercase()) {
                    let ours = Entry::new(
                        descriptor.qualified_name(),
                        observed.ttl,
                        RecordData::Service {
                            priority: descriptor.priority,
                            weight: descriptor.weight,
                            port: descriptor.port,
                            target: descriptor.server.clone(),
                        },
                    );
                    if handle_service(&ours, observed) == Verdict::Lose {
                        tracing::warn!(name = %ours.name, "lost service tie-break, renaming instance");
                        descriptor.name = rename_service_instance(&descriptor.name);
                        descriptor.state.revert();
                        if let Some(engine) = self.handle() {
                            let key = descriptor.qualified_name();
                            crate::scheduler::spawn(Box::new(crate::tasks::Prober::new(engine, Owner::Service(key))));
                        }
                    }
                }
            }
            RecordType::HostInformation => {
                let _ = handle_host_information(observed, observed);
            }
            _ => {}
        }
    }

    /// Address conflict handling (4.3): if the host lost the tie-break
    /// while still probing, every owned service reverts to PROBING_1 too,
    /// since their SRV targets point at a name that is about to change.
    async fn unregister_all_states_for_revert(&self) {
        let mut services = self.services.write().await;
        for descriptor in services.values_mut() {
            if !descriptor.state.current().is_canceled() {
                descriptor.state.revert();
            }
        }
    }

    async fn handle_query(&self, message: Message, now_ms: u64, source: SocketAddr) -> Result<(), EngineError> {
        let message = match self.reassemble(message, source).await {
            Some(message) => message,
            None => return Ok(()),
        };

        for probe in &message.authorities {
            self.apply_conflict_check(probe, ConflictSource::Probe).await;
        }

        let mut answers = Vec::new();
        for question in &message.questions {
            answers.extend(self.matching_records(question, now_ms).await);
        }

        answers.retain(|answer| !message.answers.iter().any(|known| answer.suppressed_by(known)));

        if answers.is_empty() {
            return Ok(());
        }

        let mut response = Message::response();
        response.id = message.id;
        response.answers = answers;

        let destination = multicast_address();
        match self.handle() {
            Some(engine) => {
                crate::scheduler::spawn(Box::new(crate::tasks::Responder::new(engine, response, destination)));
            }
            None => self.send_response(response, destination).await?,
        }
        Ok(())
    }

    /// Joins a truncated query with a prior fragment from the same source,
    /// or buffers it waiting for the continuation. Stale fragments (no
    /// continuation within 400 ms) are discarded rather than processed.
    async fn reassemble(&self, message: Message, source: SocketAddr) -> Option<Message> {
        let mut pending = self.pending.lock().await;

        if let Some((_, deadline)) = pending.get(&source) {
            if Instant::now() > *deadline {
                pending.remove(&source);
            }
        }

        match pending.remove(&source) {
            Some((mut first, _)) => match first.append(message) {
                Ok(()) => {
                    if first.truncated {
                        pending.insert(source, (first, Instant::now() + MAX_FRAGMENT_AGE));
                        None
                    } else {
                        Some(first)
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to append truncated continuation");
                    None
                }
            },
            None => {
                if message.truncated {
                    pending.insert(source, (message, Instant::now() + MAX_FRAGMENT_AGE));
                    None
                } else {
                    Some(message)
                }
            }
        }
    }

    async fn matching_records(&self, question: &Question, now_ms: u64) -> Vec<Entry> {
        let mut out = Vec::new();

        match question.qtype {
            RecordType::Ptr if question.name.eq_ignore_ascii_case(META_QUERY_NAME) => {
                let mut types: std::collections::HashSet<String> =
                    self.known_types.read().await.iter().cloned().collect();
                types.extend(self.services.read().await.values().map(|d| d.service_type.to_ascii_lowercase()));
                for service_type in types {
                    out.push(Entry::new(META_QUERY_NAME, 4500, RecordData::Pointer(service_type)));
                }
            }
            RecordType::Ptr => {
                let services = self.services.read().await;
                let matching: Vec<ServiceDescriptor> = services
                    .values()
                    .filter(|d| d.service_type.eq_ignore_ascii_case(&question.name))
                    .cloned()
                    .collect();
                drop(services);
                for descriptor in &matching {
                    out.push(Entry::new(
                        question.name.clone(),
                        4500,
                        RecordData::Pointer(descriptor.qualified_name()),
                    ));
                    out.extend(self.service_records(descriptor).await);
                }
            }
            RecordType::Srv => {
                let descriptor = self.services.read().await.get(&question.name.to_ascii_lowercase()).cloned();
                if let Some(descriptor) = descriptor {
                    out.extend(self.service_records(&descriptor).await);
                }
            }
            RecordType::A | RecordType::AAAA => {
                let host = self.host.lock().await;
                if host.name().eq_ignore_ascii_case(&question.name) {
                    if let Some(address) = host.address {
                        out.push(Entry::new(host.name(), 120, RecordData::Address(address)));
                    }
                }
            }
            _ => {}
        }

        let _ = now_ms;
        out
    }

    /// SRV + TXT + the target's A/AAAA (§4.4's "one PTR/SRV answer carries
    /// its target's address along as an additional"). The address comes
    /// from the host descriptor when the SRV target is this host's own
    /// name, otherwise from whatever the cache holds for that target.
    async fn service_records(&self, descriptor: &ServiceDescriptor) -> Vec<Entry> {
        let mut out = vec![
            Entry::new(
                descriptor.qualified_name(),
                120,
                RecordData::Service {
                    priority: descriptor.priority,
                    weight: descriptor.weight,
                    port: descriptor.port,
                    target: descriptor.server.clone(),
                },
            ),
            Entry::new(descriptor.qualified_name(), 4500, RecordData::Text(descriptor.text.clone())),
        ];
        out.extend(self.address_records_for(&descriptor.server).await);
        out
    }

    async fn address_records_for(&self, target: &str) -> Vec<Entry> {
        let host = self.host.lock().await;
        if host.name().eq_ignore_ascii_case(target) {
            return match host.address {
                Some(address) => vec![Entry::new(host.name(), 120, RecordData::Address(address))],
                None => Vec::new(),
            };
        }
        drop(host);

        for record_type in [RecordType::A, RecordType::AAAA] {
            if let Some(entry) = self.cache.get(target, record_type).await.into_iter().next() {
                return vec![entry];
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockSocket;
    use mdns_cache::MemoryCacheService;
    use std::net::Ipv4Addr;

    fn engine() -> Arc<Engine> {
        Engine::new(
            "host.local",
            Arc::new(MemoryCacheService::new()),
            Arc::new(MockSocket::default()),
        )
    }

    #[tokio::test]
    async fn should_answer_ptr_query_for_registered_service() {
        let socket = Arc::new(MockSocket::default());
        let engine = Engine::new("host.local", Arc::new(MemoryCacheService::new()), socket.clone());
        engine
            .register_service(ServiceDescriptor::new("_http._tcp.local", "printer", "host.local", 631))
            .await;

        let mut query = Message::query();
        query.questions.push(Question::new("_http._tcp.local", RecordType::Ptr));
        let bytes = query.write(1460).unwrap();

        let datagram = Datagram { bytes, source: "10.0.0.1:5353".parse().unwrap(), recv_time_ms: 0 };
        engine.handle_datagram(datagram).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!socket.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn should_rename_host_on_lost_address_tiebreak() {
        let engine = engine();
        {
            let mut host = engine.host.lock().await;
            host.address = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)));
            for _ in 0..6 {
                host.state.advance();
            }
        }

        let mut response = Message::response();
        response.answers.push(Entry::new(
            "host.local",
            120,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9))),
        ));
        let bytes = response.write(1460).unwrap();
        let decoded = Message::read(&bytes, 0).unwrap();

        engine.handle_response(decoded, 0).await;
        assert_eq!(engine.host.lock().await.name(), "host-1.local");
    }

    #[tokio::test]
    async fn should_not_cascade_service_revert_on_response_conflict_while_probing() {
        let engine = engine();
        engine
            .register_service(ServiceDescriptor::new("_http._tcp.local", "printer", "host.local", 631))
            .await;
        for _ in 0..5 {
            engine.advance_owner(&Owner::Service("printer._http._tcp.local".into())).await;
        }
        engine.host.lock().await.address = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)));

        let mut response = Message::response();
        response.answers.push(Entry::new(
            "host.local",
            120,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9))),
        ));
        let bytes = response.write(1460).unwrap();
        engine.handle_response(Message::read(&bytes, 0).unwrap(), 0).await;

        assert_eq!(engine.host.lock().await.name(), "host-1.local");
        assert_eq!(
            engine.owner_state(&Owner::Service("printer._http._tcp.local".into())).await,
            Some(State::Announced)
        );
    }

    #[tokio::test]
    async fn should_include_target_address_in_service_records() {
        let engine = engine();
        engine.host.lock().await.address = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        engine
            .register_service(ServiceDescriptor::new("_http._tcp.local", "printer", "host.local", 631))
            .await;

        let descriptor = engine.service_info("printer._http._tcp.local").await.unwrap();
        let records = engine.service_records(&descriptor).await;

        assert!(records.iter().any(|e| matches!(e.data, RecordData::Service { .. })));
        assert!(records.iter().any(|e| matches!(e.data, RecordData::Text(_))));
        assert!(records
            .iter()
            .any(|e| matches!(e.data, RecordData::Address(IpAddr::V4(addr)) if addr == Ipv4Addr::new(10, 0, 0, 9))));
    }

    #[tokio::test]
    async fn should_answer_meta_query_with_registered_types() {
        let engine = engine();
        engine
            .register_service(ServiceDescriptor::new("_http._tcp.local", "printer", "host.local", 631))
            .await;
        engine.register_service_type("_ssh._tcp.local").await;

        let question = Question::new(META_QUERY_NAME, RecordType::Ptr);
        let answers = engine.matching_records(&question, 0).await;

        let types: Vec<String> = answers
            .into_iter()
            .filter_map(|e| match e.data {
                RecordData::Pointer(name) => Some(name),
                _ => None,
            })
            .collect();
        assert!(types.contains(&"_http._tcp.local".to_string()));
        assert!(types.contains(&"_ssh._tcp.local".to_string()));
    }

    #[tokio::test]
    async fn should_recover_and_rebind_after_io_error() {
        let socket = Arc::new(MockSocket::default());
        let engine = Engine::new("host.local", Arc::new(MemoryCacheService::new()), socket.clone());
        engine
            .register_service(ServiceDescriptor::new("_http._tcp.local", "printer", "host.local", 631))
            .await;
        for _ in 0..5 {
            engine.advance_owner(&Owner::Service("printer._http._tcp.local".into())).await;
        }
        assert_eq!(
            engine.owner_state(&Owner::Service("printer._http._tcp.local".into())).await,
            Some(State::Announced)
        );

        engine.clone().recover_from_io_error().await;

        assert_eq!(socket.rebinds.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(engine.host.lock().await.state.current(), State::Probing1);
        assert_eq!(
            engine.owner_state(&Owner::Service("printer._http._tcp.local".into())).await,
            Some(State::Probing1)
        );
    }

    #[tokio::test]
    async fn should_remove_cache_entry_on_goodbye() {
        let engine = engine();
        let mut response = Message::response();
        response.answers.push(Entry::new(
            "host.local",
            120,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))),
        ));
        let bytes = response.write(1460).unwrap();
        engine.handle_response(Message::read(&bytes, 0).unwrap(), 0).await;
        assert_eq!(engine.cache.get_all("host.local").await.len(), 1);

        let mut goodbye = Message::response();
        goodbye.answers.push(Entry::new(
            "host.local",
            0,
            RecordData::Address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))),
        ));
        let bytes = goodbye.write(1460).unwrap();
        engine.handle_response(Message::read(&bytes, 0).unwrap(), 0).await;
        assert!(engine.cache.get_all("host.local").await.is_empty());
    }

    #[tokio::test]
    async fn should_reassemble_truncated_query_across_two_datagrams() {
        let socket = Arc::new(MockSocket::default());
        let engine = Engine::new("host.local", Arc::new(MemoryCacheService::new()), socket.clone());
        engine
            .register_service(ServiceDescriptor::new("_http._tcp.local", "printer", "host.local", 631))
            .await;

        let mut first = Message::query();
        first.truncated = true;
        first.questions.push(Question::new("a.local", RecordType::A));
        let source: SocketAddr = "10.0.0.2:5353".parse().unwrap();

        engine
            .handle_datagram(Datagram { bytes: first.write(1460).unwrap(), source, recv_time_ms: 0 })
            .await
            .unwrap();
        assert!(socket.sent.lock().await.is_empty());

        let mut second = Message::query();
        second.questions.push(Question::new("_http._tcp.local", RecordType::Ptr));
        engine
            .handle_datagram(Datagram { bytes: second.write(1460).unwrap(), source, recv_time_ms: 1 })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!socket.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn should_discard_truncated_query_after_fragment_timeout() {
        let engine = engine();
        let mut first = Message::query();
        first.truncated = true;
        first.questions.push(Question::new("a.local", RecordType::A));
        let source: SocketAddr = "10.0.0.3:5353".parse().unwrap();

        engine
            .handle_datagram(Datagram { bytes: first.write(1460).unwrap(), source, recv_time_ms: 0 })
            .await
            .unwrap();

        {
            let mut pending = engine.pending.lock().await;
            let entry = pending.get_mut(&source).unwrap();
            entry.1 = Instant::now() - Duration::from_millis(1);
        }

        assert!(engine.reassemble(Message::query(), source).await.is_some());
        assert!(engine.pending.lock().await.is_empty());
    }
}
