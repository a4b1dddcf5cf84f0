use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// What a [`Task`] wants to happen next: run again after a delay, or stop.
/// A task observes its owner's state at the top of `run` and returns `Done`
/// once that state has moved to CANCELED — this is the self-cancellation
/// the scheduler relies on instead of an external cancel handle.
pub enum Outcome {
    Reschedule(Duration),
    Done,
}

#[async_trait::async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(&mut self) -> Outcome;
}

/// Spawns `task` onto its own self-rescheduling loop. Each task runs on its
/// own tokio timer rather than a literal single shared thread, but bodies
/// still execute to completion one at a time — nothing here interleaves a
/// single task's own steps.
pub fn spawn(mut task: Box<dyn Task>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match task.run().await {
                Outcome::Reschedule(delay) => tokio::time::sleep(delay).await,
                Outcome::Done => break,
            }
        }
    })
}

pub fn jitter(max_ms: u64) -> Duration {
    let ms = rand::thread_rng().gen_range(0..=max_ms);
    Duration::from_millis(ms)
}

/// Runs a closure every `interval`, forever, unless `should_stop` reports
/// true — used for the Reaper, whose only job is periodic cache eviction.
pub struct Periodic<F, S> {
    pub interval: Duration,
    pub action: F,
    pub should_stop: S,
}

#[async_trait::async_trait]
impl<F, S> Task for Periodic<F, S>
where
    F: FnMut() -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    S: FnMut() -> bool + Send + Sync + 'static,
{
    async fn run(&mut self) -> Outcome {
        if (self.should_stop)() {
            return Outcome::Done;
        }
        (self.action)().await;
        Outcome::Reschedule(self.interval)
    }
}

/// Runs `action` at each of a fixed list of delays (relative to the previous
/// firing) and then stops — the shape shared by Prober, Announcer, Renewer,
/// and the three PTR/SRV backoff resolvers (ServiceResolver, InfoResolver,
/// TypeResolver), which differ only in their delay table and query body.
pub struct Passes<F, S> {
    pub delays: Vec<Duration>,
    pub next: usize,
    pub action: F,
    pub should_stop: S,
}

impl<F, S> Passes<F, S> {
    pub fn new(delays: Vec<Duration>, action: F, should_stop: S) -> Self {
        Self { delays, next: 0, action, should_stop }
    }
}

#[async_trait::async_trait]
impl<F, S> Task for Passes<F, S>
where
    F: FnMut(usize) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    S: FnMut() -> bool + Send + Sync + 'static,
{
    async fn run(&mut self) -> Outcome {
        if (self.should_stop)() || self.next >= self.delays.len() {
            return Outcome::Done;
        }
        let delay = self.delays[self.next];
        tokio::time::sleep(delay).await;
        if (self.should_stop)() {
            return Outcome::Done;
        }
        (self.action)(self.next).await;
        self.next += 1;
        if self.next >= self.delays.len() {
            Outcome::Done
        } else {
            Outcome::Reschedule(Duration::from_millis(0))
        }
    }
}

pub fn prober_delays() -> Vec<Duration> {
    vec![jitter(250), Duration::from_millis(250), Duration::from_millis(250)]
}

pub fn announcer_delays() -> Vec<Duration> {
    vec![Duration::from_millis(0), Duration::from_millis(1000)]
}

/// Deltas (not absolute offsets) between consecutive renewal points at
/// 80/85/90/95% of `ttl_secs`, so sleeping them sequentially lands each
/// renewal at the intended percentage of TTL instead of stacking all four
/// percentages end to end.
pub fn renewer_delays(ttl_secs: u32) -> Vec<Duration> {
    let ttl_ms = ttl_secs as u64 * 1000;
    [80, 85, 90, 95]
        .iter()
        .scan(0u64, |prev, pct| {
            let absolute = ttl_ms * pct / 100;
            let delta = absolute - *prev;
            *prev = absolute;
            Some(Duration::from_millis(delta))
        })
        .collect()
}

pub fn resolver_delays() -> Vec<Duration> {
    vec![
        Duration::from_millis(225),
        Duration::from_millis(450),
        Duration::from_millis(900),
    ]
}

pub fn goodbye_delays() -> Vec<Duration> {
    vec![Duration::from_millis(0), Duration::from_millis(125), Duration::from_millis(125)]
}

pub fn responder_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(20..=120))
}

pub fn reaper_interval() -> Duration {
    Duration::from_secs(10)
}

/// Marker used by tests and by `Passes`'s `should_stop` closures to read a
/// shared cancellation flag without pulling in the full descriptor type.
pub type StopFlag = Arc<std::sync::atomic::AtomicBool>;

pub fn stop_flag() -> StopFlag {
    Arc::new(std::sync::atomic::AtomicBool::new(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn should_run_all_passes_then_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut passes = Passes::new(
            vec![Duration::from_millis(1), Duration::from_millis(1)],
            move |_| {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }) as futures::future::BoxFuture<'static, ()>
            },
            || false,
        );

        loop {
            match passes.run().await {
                Outcome::Reschedule(_) => continue,
                Outcome::Done => break,
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn should_space_renewer_delays_as_deltas_not_absolutes() {
        let delays = renewer_delays(1);
        let total_ms: u64 = delays.iter().map(|d| d.as_millis() as u64).sum();
        assert_eq!(total_ms, 950);
        assert_eq!(delays[0], Duration::from_millis(800));
        assert_eq!(delays[1], Duration::from_millis(50));
        assert_eq!(delays[2], Duration::from_millis(50));
        assert_eq!(delays[3], Duration::from_millis(50));
    }

    #[tokio::test]
    async fn should_stop_immediately_when_flag_set() {
        let mut passes = Passes::new(
            vec![Duration::from_millis(1)],
            |_| Box::pin(async {}) as futures::future::BoxFuture<'static, ()>,
            || true,
        );
        assert!(matches!(passes.run().await, Outcome::Done));
    }
}
