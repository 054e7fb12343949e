use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Process-local stop flag observed by every blocking wait in the crate.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps in `step` slices until triggered or `timeout` elapses.
    /// Returns whether the signal fired.
    pub fn wait_timeout(&self, timeout: Duration, step: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

/// Routes SIGINT/SIGTERM into a [`ShutdownSignal`].
pub struct ShutdownHooks {
    signal: ShutdownSignal,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install(signal: &ShutdownSignal) -> io::Result<Self> {
        let signal = signal.clone();

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&signal.triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&signal.triggered))?;
            return Ok(Self {
                signal,
                sig_ids: vec![id_int, id_term],
            });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { signal })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.signal.is_triggered()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
