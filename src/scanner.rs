//! Scanner/scheduler: one badge task at a time
//!
//! Polls the adapter's device table, picks the badge that has waited
//! longest, and spawns a bounded-lifetime task for it. The adapter only
//! allows one pending connect, so the loop reserves the busy-connecting
//! slot before spawning and the scoped connection releases it once the
//! handshake completes.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use nametag_device::{id_if_badge, Badge, ProtocolError};
use nametag_transport::{Adapter, Connection, Device, TransportError};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler tuning knobs (delays in seconds).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerOptions {
    /// Leave a badge alone this long after a successful task.
    pub success_delay: f64,
    /// Leave a badge alone this long after any attempt.
    pub attempt_delay: f64,
    /// Poll-loop sleep.
    pub loop_delay: f64,
    /// Ignore badges not seen within this long (the candidate filter
    /// allows up to twice this age).
    pub maximum_age: f64,
    /// Ignore badges at or below this signal strength.
    pub minimum_rssi: i16,
    /// Kill a badge task after this long.
    pub task_timeout: f64,
    /// Emit a status line at most this often.
    pub status_interval: f64,
}

impl Default for ScannerOptions {
    fn default() -> ScannerOptions {
        ScannerOptions {
            success_delay: 30.0,
            attempt_delay: 0.0,
            loop_delay: 0.1,
            maximum_age: 5.0,
            minimum_rssi: -80,
            task_timeout: 30.0,
            status_interval: 0.5,
        }
    }
}

/// Why a visible badge is not being connected right now (or that it is).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BadgeStatus {
    Connected,
    Pending,
    Running,
    CoolingDown,
    TooOld,
    WeakSignal,
    Queued,
    Spawn,
}

fn classify(
    now: Instant,
    connected: bool,
    disconnected: bool,
    running: bool,
    delay_until: Option<Instant>,
    last_seen: Instant,
    rssi: i16,
    ready: bool,
    options: &ScannerOptions,
) -> BadgeStatus {
    if connected {
        BadgeStatus::Connected
    } else if !disconnected {
        BadgeStatus::Pending
    } else if running {
        BadgeStatus::Running
    } else if delay_until.is_some_and(|until| now < until) {
        BadgeStatus::CoolingDown
    } else if now.saturating_duration_since(last_seen)
        > Duration::from_secs_f64(options.maximum_age)
    {
        BadgeStatus::TooOld
    } else if rssi <= options.minimum_rssi || rssi == 0 {
        BadgeStatus::WeakSignal
    } else if !ready {
        BadgeStatus::Queued
    } else {
        BadgeStatus::Spawn
    }
}

fn sigil(status: BadgeStatus, id: &str) -> String {
    match status {
        BadgeStatus::Connected => format!("|{id}|"),
        BadgeStatus::Pending => format!(":{id}:"),
        BadgeStatus::Running => format!(".{id}."),
        BadgeStatus::CoolingDown => format!("+{id}+"),
        BadgeStatus::TooOld => format!("/{id}/"),
        BadgeStatus::WeakSignal => format!("-{id}-"),
        BadgeStatus::Queued => format!("({id})"),
        BadgeStatus::Spawn => format!("*{id}*"),
    }
}

/// Scan for badges and run `runner` on each, one connection at a time.
///
/// Returns the session error when the adapter fails, or `Ok(())` once
/// `shutdown` fires. Either way every outstanding badge task is
/// cancelled and awaited before returning.
pub async fn scan_and_spawn<F, Fut>(
    adapter: Rc<Adapter>,
    runner: F,
    options: &ScannerOptions,
    shutdown: CancellationToken,
) -> Result<(), TransportError>
where
    F: Fn(Badge) -> Fut + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    let tasks: Rc<RefCell<HashMap<String, tokio::task::JoinHandle<()>>>> =
        Rc::new(RefCell::new(HashMap::new()));
    let attempts: Rc<RefCell<HashMap<String, Instant>>> = Rc::new(RefCell::new(HashMap::new()));
    let successes: Rc<RefCell<HashMap<String, Instant>>> = Rc::new(RefCell::new(HashMap::new()));
    // Badge tasks race this token so scoped teardown always runs.
    let scope = CancellationToken::new();

    debug!("Starting scan loop...");
    let mut next_status = Instant::now();
    let result = loop {
        if shutdown.is_cancelled() {
            break Ok(());
        }
        if let Some(err) = adapter.failure() {
            break Err(err);
        }

        let now = Instant::now();
        let fresh_within = Duration::from_secs_f64(2.0 * options.maximum_age);
        let mut candidates: Vec<(String, Rc<Device>)> = adapter
            .devices()
            .into_iter()
            .filter_map(|dev| id_if_badge(&dev).map(|id| (id, dev)))
            .filter(|(_, dev)| now.saturating_duration_since(dev.last_seen()) < fresh_within)
            .collect();
        // Least-recently-acted-upon first; deterministic tie-break on id.
        candidates.sort_by_key(|(id, _)| {
            (
                successes.borrow().get(id).copied(),
                attempts.borrow().get(id).copied(),
                id.clone(),
            )
        });

        let mut statuses: BTreeMap<String, String> = BTreeMap::new();
        let mut spawned = false;
        for (id, dev) in &candidates {
            let delay_until = [
                (successes.borrow().get(id).copied(), options.success_delay),
                (attempts.borrow().get(id).copied(), options.attempt_delay),
            ]
            .into_iter()
            .filter_map(|(mark, delay)| Some(mark? + Duration::from_secs_f64(delay)))
            .max();

            let status = classify(
                now,
                dev.fully_connected(),
                dev.fully_disconnected(),
                tasks.borrow().contains_key(id),
                delay_until,
                dev.last_seen(),
                dev.rssi(),
                adapter.ready_to_connect(dev),
                options,
            );
            statuses.insert(id.clone(), sigil(status, id));

            if status == BadgeStatus::Spawn {
                attempts.borrow_mut().insert(id.clone(), now);
                adapter.mark_busy(dev.addr());
                let handle = tokio::task::spawn_local(badge_task(
                    adapter.clone(),
                    dev.clone(),
                    id.clone(),
                    runner.clone(),
                    options.task_timeout,
                    scope.clone(),
                    tasks.clone(),
                    successes.clone(),
                ));
                tasks.borrow_mut().insert(id.clone(), handle);
                spawned = true;
            }
        }
        // Tasks for badges that scanned out of sight are still running.
        for id in tasks.borrow().keys() {
            statuses
                .entry(id.clone())
                .or_insert_with(|| format!("_{id}_"));
        }

        if now >= next_status || spawned {
            let line: Vec<&str> = statuses.values().map(String::as_str).collect();
            if line.is_empty() {
                info!("Badges: (none)");
            } else {
                info!("Badges: {}", line.join(" "));
            }
            next_status = now + Duration::from_secs_f64(options.status_interval);
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(options.loop_delay)) => {}
            _ = shutdown.cancelled() => {}
        }
    };

    let outstanding: Vec<_> = tasks.borrow_mut().drain().collect();
    if !outstanding.is_empty() {
        debug!("Stopping {} badge tasks pre-exit...", outstanding.len());
        scope.cancel();
        futures::future::join_all(outstanding.into_iter().map(|(_, handle)| handle)).await;
        debug!("All badge tasks stopped");
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn badge_task<F, Fut>(
    adapter: Rc<Adapter>,
    dev: Rc<Device>,
    id: String,
    runner: F,
    task_timeout: f64,
    scope: CancellationToken,
    tasks: Rc<RefCell<HashMap<String, tokio::task::JoinHandle<()>>>>,
    successes: Rc<RefCell<HashMap<String, Instant>>>,
) where
    F: Fn(Badge) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    let body = async {
        debug!("[{id}] Connecting...");
        let conn = Connection::open(adapter.clone(), dev.clone()).await?;
        let badge = Badge::new(adapter.clone(), dev.clone())
            .ok_or_else(|| anyhow::anyhow!("{id}: device is not a badge"))?;
        debug!("[{id}] Connected, running badge task...");
        tokio::time::timeout(Duration::from_secs_f64(task_timeout), runner(badge))
            .await
            .map_err(anyhow::Error::from)??;
        debug!("[{id}] Badge task complete, flushing...");
        adapter.flush(&dev).await?;
        debug!("[{id}] Flush complete, disconnecting...");
        conn.close().await?;
        Ok::<(), anyhow::Error>(())
    };

    let outcome = tokio::select! {
        _ = scope.cancelled() => None,
        result = body => Some(result),
    };

    // Failsafe: the scoped connection normally hands the slot back.
    adapter.clear_busy(dev.addr());
    tasks.borrow_mut().remove(&id);

    match outcome {
        None => debug!("[{id}] Badge task cancelled"),
        Some(Ok(())) => {
            successes.borrow_mut().insert(id.clone(), Instant::now());
            debug!("[{id}] Badge task successful");
        }
        Some(Err(err)) => log_task_failure(&id, &err),
    }
}

/// Connection losses and protocol hiccups are routine; anything else is
/// a bug worth a backtrace.
fn log_task_failure(id: &str, err: &anyhow::Error) {
    if let Some(e) = err.downcast_ref::<TransportError>() {
        warn!("[{id}] {e}");
    } else if let Some(e) = err.downcast_ref::<ProtocolError>() {
        warn!("[{id}] {e}");
    } else if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        warn!("[{id}] Badge task timed out");
    } else {
        error!("[{id}] Badge task failed: {err:?}");
    }
}
