use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::probe;
use crate::app::history::{History, HistoryStorage, ProbeResult};
use crate::common::http::ProbeTarget;
use crate::config::{self, UrlTestOutboundSettings};
use crate::proxy::interrupt::Interrupter;
use crate::proxy::{real_outbound, real_tag, supports, AnyOutboundHandler};
use crate::session::Network;

const DEFAULT_URL: &str = "https://www.gstatic.com/generate_204";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(3 * 60);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_TOLERANCE: u16 = 50;

/// Clears the checking flag when a probe round ends, however it ends.
struct CheckGuard<'a>(&'a AtomicBool);

impl<'a> CheckGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(CheckGuard(flag))
        }
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Selection state of an urltest outbound.
///
/// Each transport has its own selected member and failure counter. Members
/// are probed on a ticker which only runs while the group sees traffic: the
/// first dial after a period of idleness restarts it, and a tick finding the
/// group idle for longer than `idle_timeout` stops it again.
pub struct UrlTestGroup {
    tag: String,
    members: Vec<AnyOutboundHandler>,
    target: ProbeTarget,
    interval: Duration,
    tolerance: u16,
    idle_timeout: Duration,
    default_tag: Option<String>,
    history: Arc<HistoryStorage>,
    selected_tcp: RwLock<Option<AnyOutboundHandler>>,
    selected_udp: RwLock<Option<AnyOutboundHandler>>,
    tcp_failures: AtomicUsize,
    udp_failures: AtomicUsize,
    checking: AtomicBool,
    started: AtomicBool,
    last_active: Mutex<Instant>,
    ticker: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
    pub(super) interrupter: Interrupter,
}

impl UrlTestGroup {
    pub fn new(
        tag: String,
        members: Vec<AnyOutboundHandler>,
        settings: &UrlTestOutboundSettings,
        history: Arc<HistoryStorage>,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(anyhow!("missing member outbounds"));
        }
        let target = ProbeTarget::parse(settings.url.as_deref().unwrap_or(DEFAULT_URL))?;
        let interval = config::duration_or(settings.interval.as_deref(), DEFAULT_INTERVAL)?;
        let idle_timeout =
            config::duration_or(settings.idle_timeout.as_deref(), DEFAULT_IDLE_TIMEOUT)?;
        if interval.is_zero() {
            return Err(anyhow!("interval must be greater than zero"));
        }
        if interval > idle_timeout {
            return Err(anyhow!("interval must be less or equal than idle_timeout"));
        }
        if let Some(d) = settings.default.as_deref() {
            if !members.iter().any(|m| m.tag() == d) {
                return Err(anyhow!("default outbound not found: {}", d));
            }
        }
        Ok(UrlTestGroup {
            tag,
            members,
            target,
            interval,
            tolerance: settings.tolerance.unwrap_or(DEFAULT_TOLERANCE),
            idle_timeout,
            default_tag: settings.default.clone(),
            history,
            selected_tcp: RwLock::new(None),
            selected_udp: RwLock::new(None),
            tcp_failures: AtomicUsize::new(0),
            udp_failures: AtomicUsize::new(0),
            checking: AtomicBool::new(false),
            started: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            ticker: Mutex::new(None),
            cancel: CancellationToken::new(),
            interrupter: Interrupter::new(settings.interrupt_exist_connections),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn members(&self) -> &[AnyOutboundHandler] {
        &self.members
    }

    fn slot(&self, network: Network) -> &RwLock<Option<AnyOutboundHandler>> {
        match network {
            Network::Tcp => &self.selected_tcp,
            Network::Udp => &self.selected_udp,
        }
    }

    fn failures(&self, network: Network) -> &AtomicUsize {
        match network {
            Network::Tcp => &self.tcp_failures,
            Network::Udp => &self.udp_failures,
        }
    }

    pub fn selected(&self, network: Network) -> Option<AnyOutboundHandler> {
        self.slot(network).read().clone()
    }

    /// Computes the best member for `network` from the probe history without
    /// changing the selection. The flag is false when no member has a usable
    /// result and the returned member is only a fallback.
    pub fn select(&self, network: Network) -> (Option<AnyOutboundHandler>, bool) {
        let mut min_delay: u16 = 0;
        let mut min_outbound: Option<AnyOutboundHandler> = None;

        // Start from the current selection so a member within the tolerance
        // of it cannot take over.
        if let Some(current) = self.selected(network) {
            if let Some(h) = self.history.load(&real_tag(&current)) {
                if h.is_ok() {
                    min_delay = h.delay;
                    min_outbound = Some(current);
                }
            }
        }
        for member in self.members.iter() {
            if !supports(member, network) {
                continue;
            }
            let h = match self.history.load(&real_tag(member)) {
                Some(h) if h.is_ok() => h,
                _ => continue,
            };
            if min_delay == 0 || h.delay as u32 + self.tolerance as u32 <= min_delay as u32 {
                min_delay = h.delay;
                min_outbound = Some(member.clone());
            }
        }
        if min_outbound.is_some() {
            return (min_outbound, true);
        }

        let fallback = self
            .default_tag
            .as_deref()
            .and_then(|d| {
                self.members
                    .iter()
                    .find(|m| m.tag() == d && supports(m, network))
            })
            .or_else(|| self.members.iter().find(|m| supports(m, network)))
            .cloned();
        (fallback, false)
    }

    /// Applies the result of [`select`](Self::select) to both transports.
    /// An empty slot always takes the fallback, an occupied one only moves to
    /// a confirmed member.
    pub fn perform_update_check(&self) {
        let mut changed = false;
        for network in [Network::Tcp, Network::Udp] {
            let (outbound, confirmed) = self.select(network);
            let outbound = match outbound {
                Some(o) => o,
                None => continue,
            };
            let mut slot = self.slot(network).write();
            match slot.as_ref() {
                None => {
                    debug!("[{}] {} selected [{}]", &self.tag, network, outbound.tag());
                    *slot = Some(outbound);
                }
                Some(current) if confirmed && current.tag() != outbound.tag() => {
                    info!(
                        "[{}] {} switched [{}] -> [{}]",
                        &self.tag,
                        network,
                        current.tag(),
                        outbound.tag()
                    );
                    *slot = Some(outbound);
                    changed = true;
                }
                _ => (),
            }
        }
        if changed {
            self.interrupter.interrupt();
        }
    }

    /// Probes members and refreshes the selection. Returns immediately when
    /// another round is already running.
    pub async fn check_outbounds(&self, force: bool) {
        let _ = self.url_test_round(force).await;
    }

    /// Probes every member now. While a round is already running the last
    /// recorded results are returned instead.
    pub async fn url_test(&self) -> HashMap<String, ProbeResult> {
        match self.url_test_round(true).await {
            Some(results) => results,
            None => {
                debug!("[{}] probe already running, reporting history", &self.tag);
                self.results()
            }
        }
    }

    /// Last probe result of every member, keyed by member tag.
    pub fn results(&self) -> HashMap<String, ProbeResult> {
        self.members
            .iter()
            .filter_map(|m| {
                self.history
                    .load(&real_tag(m))
                    .map(|h| (m.tag().to_string(), ProbeResult::from(&h)))
            })
            .collect()
    }

    async fn url_test_round(&self, force: bool) -> Option<HashMap<String, ProbeResult>> {
        let _guard = CheckGuard::acquire(&self.checking)?;

        // Members reaching the same real outbound are probed once.
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for member in self.members.iter() {
            let real = real_outbound(member, Network::Tcp);
            let tag = real.tag().to_string();
            if !seen.insert(tag.clone()) {
                continue;
            }
            if !force {
                if let Some(h) = self.history.load(&tag) {
                    let fresh = h
                        .time
                        .elapsed()
                        .map(|age| age < self.interval)
                        .unwrap_or(false);
                    if fresh {
                        continue;
                    }
                }
            }
            jobs.push((tag, real));
        }
        trace!("[{}] probing {} outbounds", &self.tag, jobs.len());

        let probes: Vec<_> = jobs
            .into_iter()
            .map(|(tag, real)| {
                let target = self.target.clone();
                let history = self.history.clone();
                let group = self.tag.clone();
                async move {
                    let h = match probe::url_test(&real, &target).await {
                        Ok(delay) => {
                            debug!("[{}] outbound [{}] available: {}ms", &group, &tag, delay);
                            History::success(delay)
                        }
                        Err(e) => {
                            debug!("[{}] outbound [{}] unavailable: {}", &group, &tag, e);
                            History::failure(e.to_string())
                        }
                    };
                    history.store(&tag, h);
                }
            })
            .collect();
        let round = stream::iter(probes)
            .buffer_unordered(*crate::option::URLTEST_CONCURRENCY)
            .collect::<Vec<()>>();
        tokio::select! {
            _ = self.cancel.cancelled() => return None,
            _ = round => (),
        }

        self.perform_update_check();
        Some(self.results())
    }

    /// Marks the group as running: selects from existing history, probes
    /// stale members in the background and starts the ticker.
    pub fn post_start(self: &Arc<Self>) {
        self.started.store(true, Ordering::Release);
        self.perform_update_check();
        self.spawn_check(false);
        self.touch();
    }

    pub fn update_check(self: &Arc<Self>) {
        self.spawn_check(false);
    }

    fn spawn_check(self: &Arc<Self>, force: bool) {
        let group = self.clone();
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => (),
                _ = group.check_outbounds(force) => (),
            }
        });
    }

    /// Records traffic through the group, restarting the ticker if it went
    /// idle.
    pub fn touch(self: &Arc<Self>) {
        if !self.started.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return;
        }
        *self.last_active.lock() = Instant::now();
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let token = self.cancel.child_token();
        *ticker = Some(token.clone());
        debug!("[{}] ticker started", &self.tag);
        tokio::spawn(run_ticker(Arc::downgrade(self), self.interval, token));
    }

    /// Stops the ticker if the group has been idle too long.
    fn stop_if_idle(&self) -> bool {
        let mut ticker = self.ticker.lock();
        if self.last_active.lock().elapsed() < self.idle_timeout {
            return false;
        }
        if let Some(token) = ticker.take() {
            token.cancel();
        }
        debug!("[{}] idle, ticker stopped", &self.tag);
        true
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Feeds the outcome of a dial through `outbound` back into the group.
    pub fn report_dial(self: &Arc<Self>, network: Network, outbound: &AnyOutboundHandler, ok: bool) {
        let counter = self.failures(network);
        if ok {
            counter.store(0, Ordering::Release);
            self.history.clear_error(&real_tag(outbound));
            return;
        }

        let threshold = *crate::option::URLTEST_MIN_FAILURE_TO_RESET;
        // Wraps to zero at the threshold so exactly one caller resets.
        let prev = match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(if n + 1 >= threshold { 0 } else { n + 1 })
        }) {
            Ok(n) | Err(n) => n,
        };
        if prev + 1 < threshold {
            return;
        }

        warn!(
            "[{}] {} consecutive {} failures through [{}], reselecting",
            &self.tag,
            threshold,
            network,
            outbound.tag()
        );
        *self.slot(network).write() = None;
        self.perform_update_check();
        let reselected = self.selected(network);
        if reselected.map_or(false, |o| o.tag() == outbound.tag()) {
            self.spawn_check(true);
        }
    }

    pub fn failure_count(&self, network: Network) -> usize {
        self.failures(network).load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.ticker.lock().take();
    }
}

async fn run_ticker(group: Weak<UrlTestGroup>, period: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => (),
        }
        let group = match group.upgrade() {
            Some(g) => g,
            None => return,
        };
        if group.stop_if_idle() {
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = group.check_outbounds(false) => (),
        }
    }
}
