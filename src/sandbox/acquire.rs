//! Single-flight acquisition of the session's sandbox.
//!
//! The first caller boots the backend. Callers arriving while that boot is in
//! flight share the same future instead of starting their own. A successful
//! boot is cached for the rest of the session; a failed one is forgotten so
//! the next call can try again.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use super::{DockerSandbox, LocalSandbox, SandboxError, SandboxHandle};
use crate::config::{Backend, SandboxConfig};

/// Starts a sandbox backend.
pub type BootFn = Box<dyn Fn() -> BoxFuture<'static, Result<SandboxHandle, SandboxError>> + Send + Sync>;

type PendingBoot = Shared<BoxFuture<'static, Result<SandboxHandle, SandboxError>>>;

enum AcquireState {
    Idle,
    Booting(PendingBoot),
    Ready(SandboxHandle),
}

/// Hands out the one live sandbox of a session.
pub struct EnvironmentAcquirer {
    boot: BootFn,
    state: Mutex<AcquireState>,
    boots: AtomicUsize,
}

impl EnvironmentAcquirer {
    /// Creates an acquirer that boots with `boot` on first use.
    pub fn new(boot: BootFn) -> Self {
        Self {
            boot,
            state: Mutex::new(AcquireState::Idle),
            boots: AtomicUsize::new(0),
        }
    }

    /// Returns the session's sandbox, booting it if needed.
    pub async fn acquire(&self) -> Result<SandboxHandle, SandboxError> {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                AcquireState::Ready(handle) => return Ok(Arc::clone(handle)),
                AcquireState::Booting(pending) => {
                    debug!("Sandbox boot already in flight, joining it");
                    pending.clone()
                }
                AcquireState::Idle => {
                    info!("Booting sandbox");
                    self.boots.fetch_add(1, Ordering::SeqCst);
                    let pending = (self.boot)().shared();
                    *state = AcquireState::Booting(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let still_current =
            matches!(&*state, AcquireState::Booting(current) if current.ptr_eq(&pending));
        match &result {
            Ok(handle) => {
                if still_current {
                    info!("Sandbox ready ({})", handle.name());
                    *state = AcquireState::Ready(Arc::clone(handle));
                }
            }
            Err(e) => {
                if still_current {
                    *state = AcquireState::Idle;
                }
                if e.is_unavailable() {
                    error!("Sandbox backend unavailable: {}", e);
                } else {
                    warn!("Sandbox boot failed: {}", e);
                }
            }
        }
        result
    }

    /// Returns the cached sandbox without booting.
    pub fn current(&self) -> Option<SandboxHandle> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            AcquireState::Ready(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Number of boots started so far.
    pub fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }
}

/// Builds the boot function for the configured backend.
pub fn boot_from_config(config: SandboxConfig) -> BootFn {
    Box::new(move || {
        let config = config.clone();
        async move {
            let sandbox: SandboxHandle = match config.backend {
                Backend::Local => Arc::new(LocalSandbox::boot(&config).await?),
                Backend::Docker => Arc::new(DockerSandbox::boot(&config).await?),
            };
            Ok(sandbox)
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::MemorySandbox;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn counting_boot(fail_first: bool) -> BootFn {
        let failed_once = Arc::new(AtomicBool::new(!fail_first));
        Box::new(move || {
            let failed_once = Arc::clone(&failed_once);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if !failed_once.swap(true, Ordering::SeqCst) {
                    return Err(SandboxError::unavailable("isolation headers missing"));
                }
                let sandbox: SandboxHandle = Arc::new(MemorySandbox::new());
                Ok(sandbox)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_concurrent_acquire_boots_once() {
        let acquirer = EnvironmentAcquirer::new(counting_boot(false));

        let (a, b, c) = tokio::join!(acquirer.acquire(), acquirer.acquire(), acquirer.acquire());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(acquirer.boot_count(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
    }

    #[tokio::test]
    async fn test_ready_handle_is_cached() {
        let acquirer = EnvironmentAcquirer::new(counting_boot(false));
        assert!(acquirer.current().is_none());

        let first = acquirer.acquire().await.unwrap();
        let second = acquirer.acquire().await.unwrap();

        assert_eq!(acquirer.boot_count(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(acquirer.current().is_some());
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_retryable() {
        let acquirer = EnvironmentAcquirer::new(counting_boot(true));

        let (a, b) = tokio::join!(acquirer.acquire(), acquirer.acquire());
        let err = a.err().unwrap();
        assert!(err.is_unavailable());
        assert!(b.err().unwrap().is_unavailable());
        assert_eq!(acquirer.boot_count(), 1);
        assert!(acquirer.current().is_none());

        let retried = acquirer.acquire().await;
        assert!(retried.is_ok());
        assert_eq!(acquirer.boot_count(), 2);
    }
}
