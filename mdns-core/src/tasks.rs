use std::sync::Arc;
use std::time::Duration;

use mdns_proto::{Entry, Message, Question, RecordType};

use crate::engine::{Engine, Owner};
use crate::scheduler::{self, spawn, Outcome, Task};
use crate::state::State;

/// Sends a probe query per pass, then hands off to [`Announcer`] once all
/// passes complete without the owner having been renamed out from under it.
///
/// Grounded on the Prober row of the scheduler task table: three passes at
/// 250 ms, the first preceded by 0-250 ms of jitter to desynchronize probes
/// from multiple hosts booting at once.
pub struct Prober {
    pub engine: Arc<Engine>,
    pub owner: Owner,
    delays: Vec<Duration>,
    next: usize,
}

impl Prober {
    pub fn new(engine: Arc<Engine>, owner: Owner) -> Self {
        Self { engine, owner, delays: scheduler::prober_delays(), next: 0 }
    }
}

#[async_trait::async_trait]
impl Task for Prober {
    async fn run(&mut self) -> Outcome {
        if matches!(self.engine.owner_state(&self.owner).await, None | Some(State::Canceled)) {
            return Outcome::Done;
        }
        tokio::time::sleep(self.delays[self.next]).await;
        if matches!(self.engine.owner_state(&self.owner).await, None | Some(State::Canceled)) {
            return Outcome::Done;
        }
        if let Err(err) = self.engine.send_probe(&self.owner).await {
            tracing::warn!(%err, "probe send failed");
        }
        self.engine.advance_owner(&self.owner).await;
        self.next += 1;
        if self.next >= self.delays.len() {
            spawn(Box::new(Announcer::new(self.engine.clone(), self.owner.clone())));
            Outcome::Done
        } else {
            Outcome::Reschedule(Duration::from_millis(0))
        }
    }
}

/// Unsolicited authoritative announcements after a successful probe: two
/// passes at 1000 ms, then ANNOUNCED and a [`Renewer`] takes over.
pub struct Announcer {
    pub engine: Arc<Engine>,
    pub owner: Owner,
    delays: Vec<Duration>,
    next: usize,
}

impl Announcer {
    pub fn new(engine: Arc<Engine>, owner: Owner) -> Self {
        Self { engine, owner, delays: scheduler::announcer_delays(), next: 0 }
    }
}

#[async_trait::async_trait]
impl Task for Announcer {
    async fn run(&mut self) -> Outcome {
        if matches!(self.engine.owner_state(&self.owner).await, None | Some(State::Canceled)) {
            return Outcome::Done;
        }
        tokio::time::sleep(self.delays[self.next]).await;
        if matches!(self.engine.owner_state(&self.owner).await, None | Some(State::Canceled)) {
            return Outcome::Done;
        }
        if let Err(err) = self.engine.send_announce(&self.owner, 120).await {
            tracing::warn!(%err, "announce send failed");
        }
        self.next += 1;
        if self.next >= self.delays.len() {
            self.engine.advance_owner(&self.owner).await;
            self.engine.clear_text_announcement(&self.owner).await;
            spawn(Box::new(Renewer::new(self.engine.clone(), self.owner.clone(), 120)));
            Outcome::Done
        } else {
            Outcome::Reschedule(Duration::from_millis(0))
        }
    }
}

/// Re-announces an ANNOUNCED name at 80/85/90/95% of its TTL, so caches
/// across the link refresh before the record would otherwise expire.
/// Stops early, without rescheduling itself, if a TXT update asks the
/// owner to restart announcing (`needs_text_announcement`) — the restart
/// itself is driven by [`Engine::set_service_text`] spawning a fresh
/// [`Announcer`], not by this task.
pub struct Renewer {
    pub engine: Arc<Engine>,
    pub owner: Owner,
    delays: Vec<Duration>,
    next: usize,
    ttl: u32,
}

impl Renewer {
    pub fn new(engine: Arc<Engine>, owner: Owner, ttl: u32) -> Self {
        Self { engine, owner, delays: scheduler::renewer_delays(ttl), next: 0, ttl }
    }
}

#[async_trait::async_trait]
impl Task for Renewer {
    async fn run(&mut self) -> Outcome {
        if matches!(self.engine.owner_state(&self.owner).await, None | Some(State::Canceled)) {
            return Outcome::Done;
        }
        if self.engine.needs_text_announcement(&self.owner).await {
            return Outcome::Done;
        }
        if self.next >= self.delays.len() {
            return Outcome::Done;
        }
        tokio::time::sleep(self.delays[self.next]).await;
        if !self.engine.owner_state(&self.owner).await.map(|s| s.is_announced()).unwrap_or(false) {
            return Outcome::Done;
        }
        if let Err(err) = self.engine.send_announce(&self.owner, self.ttl).await {
            tracing::warn!(%err, "renewal send failed");
        }
        self.next += 1;
        if self.next >= self.delays.len() {
            Outcome::Done
        } else {
            Outcome::Reschedule(Duration::from_millis(0))
        }
    }
}

/// Multicasts goodbye (TTL=0) for an owner three times at 0/125/125 ms, then
/// drops the descriptor from the registry. The owner's state is already
/// CANCELED by the time this runs (set synchronously by
/// [`Engine::unregister_service`] / [`Engine::close`]).
pub struct Canceler {
    pub engine: Arc<Engine>,
    pub owner: Owner,
    delays: Vec<Duration>,
    next: usize,
}

impl Canceler {
    pub fn new(engine: Arc<Engine>, owner: Owner) -> Self {
        Self { engine, owner, delays: scheduler::goodbye_delays(), next: 0 }
    }
}

#[async_trait::async_trait]
impl Task for Canceler {
    async fn run(&mut self) -> Outcome {
        tokio::time::sleep(self.delays[self.next]).await;
        if let Err(err) = self.engine.send_goodbye(&self.owner).await {
            tracing::warn!(%err, "goodbye send failed");
        }
        self.next += 1;
        if self.next >= self.delays.len() {
            if let Owner::Service(name) = &self.owner {
                self.engine.forget_service(name).await;
            }
            Outcome::Done
        } else {
            Outcome::Reschedule(Duration::from_millis(0))
        }
    }
}

/// Answers one matching query after a randomized 20-120 ms coalescing
/// delay. The answer set is computed when the query arrives (so
/// known-answer suppression reflects that query's known-answer section)
/// and carried into the task rather than recomputed at fire time. Sending
/// goes through [`Engine::send_response`], which splits into multiple
/// messages (TC set on all but the last) if the answers don't fit in one
/// sender UDP payload.
pub struct Responder {
    pub engine: Arc<Engine>,
    pub response: Option<Message>,
    pub destination: std::net::SocketAddr,
}

impl Responder {
    pub fn new(engine: Arc<Engine>, response: Message, destination: std::net::SocketAddr) -> Self {
        Self { engine, response: Some(response), destination }
    }
}

#[async_trait::async_trait]
impl Task for Responder {
    async fn run(&mut self) -> Outcome {
        let response = match self.response.take() {
            Some(response) => response,
            None => return Outcome::Done,
        };
        tokio::time::sleep(scheduler::responder_delay()).await;
        if let Err(err) = self.engine.send_response(response, self.destination).await {
            tracing::warn!(%err, "responder send failed");
        }
        Outcome::Done
    }
}

/// Shared backoff shape of ServiceResolver / InfoResolver / TypeResolver:
/// three PTR (or SRV+TXT) queries at 225/450/900 ms, each carrying known
/// answers from the cache so the querier never asks for data it already
/// holds with plenty of TTL left.
pub struct Resolver {
    pub engine: Arc<Engine>,
    pub question: Question,
    delays: Vec<Duration>,
    next: usize,
}

impl Resolver {
    pub fn new(engine: Arc<Engine>, question: Question) -> Self {
        Self { engine, question, delays: scheduler::resolver_delays(), next: 0 }
    }
}

#[async_trait::async_trait]
impl Task for Resolver {
    async fn run(&mut self) -> Outcome {
        if self.next >= self.delays.len() {
            return Outcome::Done;
        }
        tokio::time::sleep(self.delays[self.next]).await;
        let known: Vec<Entry> = self.engine.cache().get(&self.question.name, self.question.qtype).await;
        if let Err(err) = self.engine.send_question(self.question.clone(), known).await {
            tracing::warn!(%err, "resolver query send failed");
        }
        self.next += 1;
        if self.next >= self.delays.len() {
            Outcome::Done
        } else {
            Outcome::Reschedule(Duration::from_millis(0))
        }
    }
}

pub fn service_resolver(engine: Arc<Engine>, service_type: &str) -> Box<dyn Task> {
    Box::new(Resolver::new(engine, Question::new(service_type.to_string(), RecordType::Ptr)))
}

pub fn info_resolver(engine: Arc<Engine>, qualified_name: &str) -> Box<dyn Task> {
    Box::new(Resolver::new(engine, Question::new(qualified_name.to_string(), RecordType::Srv)))
}

pub fn type_resolver(engine: Arc<Engine>) -> Box<dyn Task> {
    Box::new(Resolver::new(engine, Question::new("_services._dns-sd._udp.local.", RecordType::Ptr)))
}
