use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::job::JobStatus;
use crate::util::backoff_delay;

/// Backoff schedule for [`Client::wait_for_completion`](crate::Client::wait_for_completion):
/// the wait after attempt `n` is `min(base_interval * 2^n, max_interval)`,
/// and the whole wait stops once `max_total_time` of wall clock has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub max_total_time: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            base_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(64),
            // 48 hours, the longest a DPS job is allowed to run.
            max_total_time: Duration::from_secs(172_800),
        }
    }
}

/// One observation of a job in flight.
#[derive(Debug)]
pub(crate) enum Probe {
    /// Job seen in a non-terminal state; keep backing off.
    Pending(JobStatus),
    /// Job reached a terminal state.
    Done(JobStatus),
    /// The probe itself failed in a retryable way (transport failure or a
    /// non-2xx API reply); retried under the same backoff schedule.
    TransportError(Error),
}

/// Drives probes until a terminal status, the time budget, or cancellation.
///
/// The probe closure returns `Err` only for fatal conditions (malformed or
/// unrecognized documents); those propagate immediately. The cancel flag is
/// honored before every probe. A sleep that could not finish inside the
/// budget is not started; the loop reports timeout instead, naming whatever
/// it last observed.
pub(crate) fn drive<P, S>(
    config: &PollConfig,
    job_id: &str,
    cancel: Option<&AtomicBool>,
    mut probe: P,
    mut sleep: S,
) -> Result<JobStatus>
where
    P: FnMut() -> Result<Probe>,
    S: FnMut(Duration),
{
    let started = Instant::now();
    let mut seen: Option<JobStatus> = None;
    let mut last = String::from("no status observed");
    let mut attempt: u32 = 0;

    loop {
        if cancelled(cancel) {
            return Err(Error::Cancelled);
        }

        match probe()? {
            Probe::Done(status) => {
                log::info!("job {job_id} finished as {status}");
                return Ok(status);
            }
            Probe::Pending(status) => {
                if seen != Some(status) {
                    log::info!("job {job_id} is {status}");
                    seen = Some(status);
                }
                last = format!("status {status}");
            }
            Probe::TransportError(err) => {
                log::warn!("status probe for job {job_id} failed: {err}");
                last = format!("transport error: {err}");
            }
        }

        let delay = backoff_delay(attempt, config.base_interval, config.max_interval);
        attempt += 1;

        if started.elapsed() + delay > config.max_total_time {
            return Err(Error::PollTimeout {
                id: job_id.to_string(),
                budget: config.max_total_time,
                last,
            });
        }
        sleep(delay);
    }
}

/// Thread sleep in short slices so a cancel flag set from another thread is
/// noticed within ~250ms instead of after a full 64s backoff interval.
pub(crate) fn interruptible_sleep(cancel: Option<&AtomicBool>, total: Duration) {
    const SLICE: Duration = Duration::from_millis(250);
    let deadline = Instant::now() + total;
    loop {
        if cancelled(cancel) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}

fn cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}
