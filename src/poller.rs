//! Background status polling
//!
//! Each cycle reads the encoder (`X0E`) and the status word (`X0U4`) as two
//! separate round trips, then hands both results to the target in one commit
//! so position and status always come from the same cycle. The target's state
//! generation is sampled before the status read; a commit carrying a stale
//! generation must not drive the state machine.

use crate::{
    protocol::{self, Request},
    status::{self, DecodedStatus},
    Result,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pause after a cycle in which the link itself was down
const LINK_DOWN_BACKOFF: Duration = Duration::from_millis(100);

/// Results of one poll cycle. `None` fields failed and must leave the
/// previous value in place.
#[derive(Debug, Clone, PartialEq)]
pub struct PollCycle {
    pub encoder_position: Option<i64>,
    pub status: Option<(String, DecodedStatus)>,
    /// Target state generation sampled before the status request
    pub generation: u64,
    /// Length of the last full cycle, yield included. For the first cycle,
    /// just its round trips.
    pub elapsed: Duration,
}

/// What the poller talks to
pub trait PollTarget: Send + Sync + 'static {
    /// One serialized request/response round trip
    fn request(&self, request: &Request) -> Result<String>;

    /// Current state generation, see [`PollCycle::generation`]
    fn state_generation(&self) -> u64;

    /// Publish one cycle's results atomically
    fn commit(&self, cycle: PollCycle);
}

/// Handle to the running poll thread
pub struct StatusPoller {
    stop: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn spawn<T: PollTarget>(target: Arc<T>, period: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicU64::new(0));

        let thread_stop = Arc::clone(&stop);
        let thread_cycles = Arc::clone(&cycles);
        let handle = thread::Builder::new()
            .name("pmd-poller".to_string())
            .spawn(move || poll_loop(target.as_ref(), period, &thread_stop, &thread_cycles))?;

        info!("Status polling started (period {:?})", period);
        Ok(Self {
            stop,
            cycles,
            handle: Some(handle),
        })
    }

    /// Completed cycles so far
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop and wait for it to exit. The current cycle completes.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Poller thread panicked");
            }
            info!("Status polling stopped after {} cycles", self.cycles());
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop<T: PollTarget + ?Sized>(target: &T, period: Duration, stop: &AtomicBool, cycles: &AtomicU64) {
    let mut previous_start: Option<Instant> = None;

    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        let mut link_down = false;

        let encoder_position = match target.request(&Request::ReadEncoder).and_then(|reply| protocol::parse_encoder_position(&reply)) {
            Ok(position) => Some(position),
            Err(e) => {
                link_down |= e.is_connection();
                warn!("Error reading encoder position: {}", e);
                None
            }
        };

        let generation = target.state_generation();
        let status = match read_status(target) {
            Ok(status) => Some(status),
            Err(e) => {
                link_down |= e.is_connection();
                warn!("Error reading controller status: {}", e);
                None
            }
        };

        // Start to start, so the previous yield counts; the first cycle has
        // only its own round trips
        let elapsed = match previous_start {
            Some(previous) => started.duration_since(previous),
            None => started.elapsed(),
        };
        previous_start = Some(started);

        target.commit(PollCycle {
            encoder_position,
            status,
            generation,
            elapsed,
        });
        cycles.fetch_add(1, Ordering::Relaxed);

        thread::sleep(if link_down { LINK_DOWN_BACKOFF } else { period });
    }
    debug!("Poll loop exited");
}

fn read_status<T: PollTarget + ?Sized>(target: &T) -> Result<(String, DecodedStatus)> {
    let reply = target.request(&Request::ReadStatus)?;
    let payload = protocol::parse_status_payload(&reply)?;
    let decoded = status::decode(&payload)?;
    Ok((payload, decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusFlag;
    use crate::PmdError;
    use std::sync::Mutex;

    /// Scripted replies, keyed by request
    struct FakeTarget {
        encoder_reply: Mutex<Result<String>>,
        status_reply: Mutex<Result<String>>,
        commits: Mutex<Vec<PollCycle>>,
        /// Bumped on every status read
        generation: AtomicU64,
    }

    impl FakeTarget {
        fn new(encoder: Result<String>, status: Result<String>) -> Arc<Self> {
            Arc::new(Self {
                encoder_reply: Mutex::new(encoder),
                status_reply: Mutex::new(status),
                commits: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
            })
        }

        fn wait_for_commits(&self, count: usize) -> Vec<PollCycle> {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let commits = self.commits.lock().unwrap().clone();
                if commits.len() >= count || Instant::now() > deadline {
                    return commits;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn clone_result(result: &Result<String>) -> Result<String> {
        match result {
            Ok(reply) => Ok(reply.clone()),
            Err(PmdError::Timeout { request, timeout }) => Err(PmdError::Timeout {
                request: request.clone(),
                timeout: *timeout,
            }),
            Err(e) => Err(PmdError::Connection(e.to_string())),
        }
    }

    impl PollTarget for FakeTarget {
        fn request(&self, request: &Request) -> Result<String> {
            match request {
                Request::ReadEncoder => clone_result(&self.encoder_reply.lock().unwrap()),
                Request::ReadStatus => {
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    clone_result(&self.status_reply.lock().unwrap())
                }
                other => panic!("unexpected request {}", other),
            }
        }

        fn state_generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }

        fn commit(&self, cycle: PollCycle) {
            self.commits.lock().unwrap().push(cycle);
        }
    }

    #[test]
    fn test_cycle_commits_position_and_status_together() {
        let target = FakeTarget::new(Ok("X0E:-4200".into()), Ok("X0U4:0021".into()));
        let mut poller = StatusPoller::spawn(Arc::clone(&target), Duration::from_micros(100)).unwrap();
        let commits = target.wait_for_commits(3);
        poller.stop();

        assert!(commits.len() >= 3);
        let cycle = &commits[0];
        assert_eq!(cycle.encoder_position, Some(-4200));
        let (raw, decoded) = cycle.status.as_ref().unwrap();
        assert_eq!(raw, "0021");
        assert_eq!(*decoded, DecodedStatus::from_flags(&[StatusFlag::TargetMode, StatusFlag::Running]));
        assert!(cycle.elapsed > Duration::ZERO);
        // Later cycles include the yield
        assert!(commits[2].elapsed >= Duration::from_micros(100));
    }

    #[test]
    fn test_generation_is_sampled_before_status_read() {
        let target = FakeTarget::new(Ok("X0E:0".into()), Ok("X0U4:0000".into()));
        let mut poller = StatusPoller::spawn(Arc::clone(&target), Duration::from_micros(100)).unwrap();
        let commits = target.wait_for_commits(3);
        poller.stop();

        // The fake bumps its generation on each status read, so every
        // cycle carries the value from just before its own read
        for (n, cycle) in commits.iter().enumerate() {
            assert_eq!(cycle.generation, n as u64);
        }
    }

    #[test]
    fn test_failures_are_independent() {
        let target = FakeTarget::new(Ok("X0E:not-a-number".into()), Ok("X0U4:0001".into()));
        let mut poller = StatusPoller::spawn(Arc::clone(&target), Duration::from_micros(100)).unwrap();
        let commits = target.wait_for_commits(1);
        poller.stop();

        assert_eq!(commits[0].encoder_position, None);
        assert!(commits[0].status.is_some());

        let target = FakeTarget::new(Ok("X0E:17".into()), Ok("X0U4:zz".into()));
        let mut poller = StatusPoller::spawn(Arc::clone(&target), Duration::from_micros(100)).unwrap();
        let commits = target.wait_for_commits(1);
        poller.stop();

        assert_eq!(commits[0].encoder_position, Some(17));
        assert_eq!(commits[0].status, None);
    }

    #[test]
    fn test_stop_joins_and_no_cycles_follow() {
        let target = FakeTarget::new(
            Err(PmdError::Timeout {
                request: "X0E".into(),
                timeout: Duration::from_millis(1),
            }),
            Ok("X0U4:0000".into()),
        );
        let mut poller = StatusPoller::spawn(Arc::clone(&target), Duration::from_millis(1)).unwrap();
        target.wait_for_commits(2);
        assert!(poller.is_running());

        poller.stop();
        assert!(!poller.is_running());
        let after_stop = target.commits.lock().unwrap().len();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(target.commits.lock().unwrap().len(), after_stop);
        assert_eq!(poller.cycles() as usize, after_stop);
    }
}
