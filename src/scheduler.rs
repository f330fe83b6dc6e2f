//! Background pass scheduling.
//!
//! Each maintenance subsystem (tombstone discard, compaction, pull and push
//! replication) owns one [`BackgroundLoop`]: a thread that runs the pass on
//! a jittered interval while enabled, plus a notify channel for enable /
//! disable / run-now / stop control. An atomic abort flag is set before any
//! control message so an in-flight pass winds down within one partition's
//! worth of work.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

enum Control {
    Enable,
    Disable,
    RunNow,
    Stop,
}

struct Notification {
    control: Control,
    done_tx: Sender<()>,
}

/// Sleep for `interval` give or take 10% of normally distributed jitter, so
/// co-started nodes do not run their passes in lockstep
fn jittered(interval: Duration, rng: &mut impl Rng) -> Duration {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    let normal = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    let secs = interval.as_secs_f64() * (1.0 + normal * 0.1);
    Duration::from_secs_f64(secs.max(0.001))
}

pub(crate) struct BackgroundLoop {
    name: &'static str,
    notify_tx: Sender<Notification>,
    abort: Arc<AtomicU32>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundLoop {
    /// Spawns the loop thread, initially disabled. `pass` runs on the loop
    /// thread and receives the abort flag it must poll.
    pub fn start(
        name: &'static str,
        interval: Duration,
        mut pass: Box<dyn FnMut(&AtomicU32) + Send>,
    ) -> Self {
        let (notify_tx, notify_rx) = bounded::<Notification>(1);
        let abort = Arc::new(AtomicU32::new(0));
        let loop_abort = abort.clone();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut enabled = false;
                let mut rng = rand::thread_rng();
                loop {
                    match notify_rx.recv_timeout(jittered(interval, &mut rng)) {
                        Ok(notification) => {
                            match notification.control {
                                Control::Enable => enabled = true,
                                Control::Disable => {
                                    loop_abort.store(1, Ordering::SeqCst);
                                    enabled = false;
                                }
                                Control::RunNow => {
                                    loop_abort.store(0, Ordering::SeqCst);
                                    pass(&loop_abort);
                                }
                                Control::Stop => {
                                    loop_abort.store(1, Ordering::SeqCst);
                                    let _ = notification.done_tx.send(());
                                    break;
                                }
                            }
                            let _ = notification.done_tx.send(());
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if enabled {
                                loop_abort.store(0, Ordering::SeqCst);
                                pass(&loop_abort);
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn background loop");

        Self {
            name,
            notify_tx,
            abort,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Shared abort flag for pass code to poll
    pub fn abort_flag(&self) -> Arc<AtomicU32> {
        self.abort.clone()
    }

    fn notify(&self, control: Control) {
        let (done_tx, done_rx) = bounded(1);
        if self.notify_tx.send(Notification { control, done_tx }).is_ok() {
            let _ = done_rx.recv();
        }
    }

    pub fn enable(&self) {
        self.notify(Control::Enable);
    }

    /// Disables the loop; any in-flight pass is aborted first
    pub fn disable(&self) {
        self.abort.store(1, Ordering::SeqCst);
        self.notify(Control::Disable);
    }

    /// Cuts any in-flight pass short, then runs one full pass to completion
    /// before returning
    pub fn run_now(&self) {
        self.abort.store(1, Ordering::SeqCst);
        self.notify(Control::RunNow);
    }

    /// Stops and joins the loop thread; the loop cannot be restarted
    pub fn stop(&self) {
        self.abort.store(1, Ordering::SeqCst);
        self.notify(Control::Stop);
        if let Some(handle) = self.handle.lock().expect("lock is poisoned").take() {
            if handle.join().is_err() {
                log::error!("{} loop panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_now_runs_exactly_one_pass() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let bg = BackgroundLoop::start(
            "test",
            Duration::from_secs(3600),
            Box::new(move |_abort| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bg.run_now();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        bg.run_now();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        bg.stop();
    }

    #[test]
    fn enabled_loop_fires_on_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let bg = BackgroundLoop::start(
            "test",
            Duration::from_millis(5),
            Box::new(move |_abort| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bg.enable();
        std::thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::SeqCst) > 0);

        bg.disable();
        let after_disable = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_disable);
        bg.stop();
    }

    #[test]
    fn run_now_clears_abort_for_its_pass() {
        let observed = Arc::new(AtomicUsize::new(99));
        let o = observed.clone();
        let bg = BackgroundLoop::start(
            "test",
            Duration::from_secs(3600),
            Box::new(move |abort| {
                o.store(abort.load(Ordering::SeqCst) as usize, Ordering::SeqCst);
            }),
        );
        bg.run_now();
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        bg.stop();
    }
}
