use std::sync::{Arc, Mutex};

use crate::git::worktree::WorktreeManager;

/// One-shot SIGINT/SIGTERM guard around the parallel scheduler.
///
/// While armed, the first signal triggers worktree cleanup that preserves
/// dirty worktrees and keeps branches, then exits with 130 (SIGINT) or 143
/// (SIGTERM). Disarmed on normal scheduler exit.
pub struct SignalGuard {
    #[cfg(unix)]
    inner: Option<unix::Armed>,
    #[cfg(not(unix))]
    _private: (),
}

impl SignalGuard {
    pub fn arm(manager: Arc<Mutex<WorktreeManager>>) -> Self {
        #[cfg(unix)]
        {
            Self {
                inner: unix::arm(manager),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = manager;
            Self { _private: () }
        }
    }

    pub fn disarm(self) {
        #[cfg(unix)]
        if let Some(armed) = self.inner {
            armed.disarm();
        }
    }
}

#[cfg(unix)]
mod unix {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::{Handle, Signals};
    use tracing::{info, warn};

    use crate::git::worktree::{CleanupOptions, WorktreeManager};

    pub struct Armed {
        armed: Arc<AtomicBool>,
        handle: Handle,
        thread: Option<JoinHandle<()>>,
    }

    pub fn arm(manager: Arc<Mutex<WorktreeManager>>) -> Option<Armed> {
        let mut signals = match Signals::new([SIGINT, SIGTERM]) {
            Ok(signals) => signals,
            Err(err) => {
                warn!(error = %err, "signals:failed to register handler");
                return None;
            }
        };
        let handle = signals.handle();
        let armed = Arc::new(AtomicBool::new(true));
        let armed_flag = armed.clone();

        let thread = std::thread::spawn(move || {
            for signal in signals.forever() {
                // One-shot: a second signal during cleanup is ignored.
                if !armed_flag.swap(false, Ordering::SeqCst) {
                    break;
                }
                info!(signal, "signals:caught, cleaning up worktrees");
                if let Ok(mut manager) = manager.lock() {
                    let result = manager.cleanup(&CleanupOptions {
                        remove_branches: false,
                        preserve_dirty: true,
                    });
                    if let Err(err) = result {
                        warn!(error = %err, "signals:cleanup failed");
                    }
                }
                std::process::exit(128 + signal);
            }
        });

        Some(Armed {
            armed,
            handle,
            thread: Some(thread),
        })
    }

    impl Armed {
        pub fn disarm(mut self) {
            self.armed.store(false, Ordering::SeqCst);
            self.handle.close();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
