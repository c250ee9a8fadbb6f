//! Heartbeat scheduler
//!
//! One ticker task drives every registered probe. The ticker starts when the
//! first probe is attached and stops when the last one is detached. On each
//! tick, every probe that is due gets its pulse spawned as a separate task,
//! so a slow probe never delays the others.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::CardioSettings;

/// Something Cardio can check for liveness
#[async_trait]
pub trait Probe: Send + Sync {
    /// `true` when the target answered. Must not fail.
    async fn pulse(&self) -> bool;

    fn name(&self) -> String {
        "probe".to_string()
    }
}

/// Called with the new health state on every healthy/unhealthy transition
pub type HealthCallback = Arc<dyn Fn(bool) + Send + Sync>;

type Registry = Mutex<Vec<Arc<CardioProbe>>>;

pub struct Cardio {
    settings: CardioSettings,
    probes: Arc<Registry>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Cardio {
    pub fn new(settings: CardioSettings) -> Self {
        Self {
            settings,
            probes: Arc::new(Mutex::new(Vec::new())),
            ticker: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &CardioSettings {
        &self.settings
    }

    /// Register `probe`, pulsing it every `interval_secs` (clamped into the
    /// configured band). Returns false if the same probe is already attached.
    pub fn attach(&self, probe: Arc<dyn Probe>, interval_secs: u64, on_change: HealthCallback) -> bool {
        let interval = self.settings.clamp_interval(interval_secs);
        let first = {
            let mut probes = self.probes.lock();
            if probes.iter().any(|p| same_probe(&p.probe, &probe)) {
                return false;
            }
            probes.push(Arc::new(CardioProbe::new(probe, interval, on_change)));
            probes.len() == 1
        };
        if first {
            self.start();
        }
        true
    }

    /// Unregister `probe`. Returns false if it was not attached.
    pub fn detach(&self, probe: &Arc<dyn Probe>) -> bool {
        let (found, empty) = {
            let mut probes = self.probes.lock();
            let position = probes.iter().position(|p| same_probe(&p.probe, probe));
            let found = match position {
                Some(i) => {
                    probes.remove(i).dispose();
                    true
                }
                None => false,
            };
            (found, probes.is_empty())
        };
        if found && empty {
            self.stop();
        }
        found
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Run one scheduling round now
    pub fn beat(&self) {
        beat(&self.probes);
    }

    #[cfg(test)]
    pub(crate) fn probes_for_test(&self) -> Vec<Arc<CardioProbe>> {
        self.probes.lock().clone()
    }

    fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let registry: Weak<Registry> = Arc::downgrade(&self.probes);
        let tick = self.settings.tick;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(probes) = registry.upgrade() else {
                    return;
                };
                beat(&probes);
            }
        }));
        log::debug!("Cardio started (tick {:?})", tick);
    }

    fn stop(&self) {
        if let Some(task) = self.ticker.lock().take() {
            task.abort();
            log::debug!("Cardio stopped");
        }
    }
}

impl Default for Cardio {
    fn default() -> Self {
        Self::new(CardioSettings::default())
    }
}

impl Drop for Cardio {
    fn drop(&mut self) {
        self.stop();
        for probe in self.probes.lock().drain(..) {
            probe.dispose();
        }
    }
}

fn same_probe(a: &Arc<dyn Probe>, b: &Arc<dyn Probe>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn beat(registry: &Registry) {
    let due: Vec<Arc<CardioProbe>> = registry
        .lock()
        .iter()
        .filter(|p| p.can_pulse())
        .cloned()
        .collect();
    for probe in due {
        tokio::spawn(async move { probe.pulse().await });
    }
}

/// Registry entry wrapping a probe with its schedule and health streaks
pub struct CardioProbe {
    probe: Arc<dyn Probe>,
    interval: Duration,
    on_change: HealthCallback,
    healthy: AtomicBool,
    pulsing: AtomicBool,
    disposed: AtomicBool,
    last_pulse: Mutex<Option<Instant>>,
    success_streak: AtomicU32,
    fail_streak: AtomicU32,
}

/// Clears the pulsing flag however the pulse ends
struct PulseGuard<'a>(&'a AtomicBool);

impl Drop for PulseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CardioProbe {
    fn new(probe: Arc<dyn Probe>, interval: Duration, on_change: HealthCallback) -> Self {
        Self {
            probe,
            interval,
            on_change,
            healthy: AtomicBool::new(true),
            pulsing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            last_pulse: Mutex::new(None),
            success_streak: AtomicU32::new(0),
            fail_streak: AtomicU32::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn fail_streak(&self) -> u32 {
        self.fail_streak.load(Ordering::Acquire)
    }

    pub fn success_streak(&self) -> u32 {
        self.success_streak.load(Ordering::Acquire)
    }

    /// Not disposed, not mid-pulse, and the interval has elapsed
    pub fn can_pulse(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) || self.pulsing.load(Ordering::Acquire) {
            return false;
        }
        match *self.last_pulse.lock() {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        }
    }

    /// Check the probe once; single-flight per probe
    pub async fn pulse(&self) {
        if self
            .pulsing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _guard = PulseGuard(&self.pulsing);
        *self.last_pulse.lock() = Some(Instant::now());

        let alive = self.probe.pulse().await;
        if alive {
            self.success_streak.fetch_add(1, Ordering::AcqRel);
            self.fail_streak.store(0, Ordering::Release);
        } else {
            self.fail_streak.fetch_add(1, Ordering::AcqRel);
            self.success_streak.store(0, Ordering::Release);
        }

        let was_healthy = self.healthy.swap(alive, Ordering::AcqRel);
        if was_healthy != alive && !self.disposed.load(Ordering::Acquire) {
            log::info!(
                "{} is {}",
                self.probe.name(),
                if alive { "healthy again" } else { "not responding" }
            );
            (self.on_change)(alive);
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}
