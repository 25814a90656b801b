use std::fmt;
use std::sync::{Condvar, Mutex};
use std::thread;

use crate::{ERR_POISONED_LOCK, Error, HeapProfiler, Result};

/// Wires a concrete memory allocator to a [`HeapProfiler`].
///
/// The installer is expected to make the allocator call
/// [`HeapProfiler::record_alloc()`] and [`HeapProfiler::record_free()`] on the given profiler
/// for every allocation and deallocation it performs.
///
/// An installer is invoked at most once per profiler: when the profiler is started for the first
/// time or, if the profiler has already been started when the installer is registered, right
/// away during registration. Any [`HeapProfiler::start()`] that happens while the installer runs
/// waits for it to return, so the installer itself must not start the profiler.
///
/// Any `FnOnce(&'static HeapProfiler)` closure that is `Send` is an installer.
///
/// # Examples
///
/// ```
/// use std::sync::LazyLock;
///
/// use heap_sampler::HeapProfiler;
///
/// static PROFILER: LazyLock<HeapProfiler> = LazyLock::new(HeapProfiler::new);
///
/// let profiler: &'static HeapProfiler = &PROFILER;
///
/// profiler
///     .set_hooks_install_callback(|profiler: &'static HeapProfiler| {
///         // Make the allocator forward its events to `profiler` here.
///         _ = profiler;
///     })
///     .unwrap();
/// ```
pub trait HooksInstaller: Send + 'static {
    /// Installs the allocator hooks, directing allocation events to `profiler`.
    fn install_hooks(self: Box<Self>, profiler: &'static HeapProfiler);
}

impl<F> HooksInstaller for F
where
    F: FnOnce(&'static HeapProfiler) + Send + 'static,
{
    fn install_hooks(self: Box<Self>, profiler: &'static HeapProfiler) {
        (*self)(profiler);
    }
}

/// Coordinates the one-time handshake between installer registration and profiler start,
/// whichever happens last triggers the installation.
///
/// The installer runs without any lock held. Every start that happens while it runs waits for
/// it to finish, so no session can begin recording before the allocator is wired up.
#[derive(Debug, Default)]
pub(crate) struct HookLifecycle {
    state: Mutex<HookState>,

    /// Signaled when an installation in progress finishes, successfully or not.
    installation_finished: Condvar,
}

#[derive(Default)]
struct HookState {
    /// Present between registration and installation.
    installer: Option<Box<dyn HooksInstaller>>,

    installer_registered: bool,
    profiler_started: bool,
    installing: bool,
    hooks_installed: bool,
}

impl HookLifecycle {
    /// Registers the installer. If the profiler has already been started, the installer is
    /// invoked before this returns.
    ///
    /// Returns whether the installer was invoked.
    pub(crate) fn register(
        &self,
        installer: Box<dyn HooksInstaller>,
        profiler: &'static HeapProfiler,
    ) -> Result<bool> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.installer_registered {
            return Err(Error::HooksInstallerAlreadySet);
        }

        state.installer_registered = true;

        if !state.profiler_started {
            state.installer = Some(installer);
            return Ok(false);
        }

        state.installing = true;
        drop(state);

        self.install(installer, profiler);
        Ok(true)
    }

    /// Marks the profiler as started. On the first start, invokes the installer registered
    /// earlier, if any. Any other start waits until an installation in progress has finished.
    ///
    /// Returns whether this call invoked the installer.
    pub(crate) fn profiler_started(&self, profiler: &'static HeapProfiler) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if !state.profiler_started {
            state.profiler_started = true;

            if let Some(installer) = state.installer.take() {
                state.installing = true;
                drop(state);

                self.install(installer, profiler);
                return true;
            }
        }

        // Another start or a late registration may be running the installer right now.
        let _state = self
            .installation_finished
            .wait_while(state, |state| state.installing)
            .expect(ERR_POISONED_LOCK);

        false
    }

    pub(crate) fn hooks_installed(&self) -> bool {
        self.state.lock().expect(ERR_POISONED_LOCK).hooks_installed
    }

    fn install(&self, installer: Box<dyn HooksInstaller>, profiler: &'static HeapProfiler) {
        // Releases the waiters even if the installer panics.
        let _finished = InstallationFinished { lifecycle: self };

        installer.install_hooks(profiler);
    }
}

/// Ends an installation on drop, marking the hooks installed unless the installer panicked.
struct InstallationFinished<'a> {
    lifecycle: &'a HookLifecycle,
}

impl Drop for InstallationFinished<'_> {
    fn drop(&mut self) {
        let mut state = self.lifecycle.state.lock().expect(ERR_POISONED_LOCK);

        state.installing = false;
        state.hooks_installed = !thread::panicking();
        drop(state);

        self.lifecycle.installation_finished.notify_all();
    }
}

impl fmt::Debug for HookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookState")
            .field("installer_pending", &self.installer.is_some())
            .field("installer_registered", &self.installer_registered)
            .field("profiler_started", &self.profiler_started)
            .field("installing", &self.installing)
            .field("hooks_installed", &self.hooks_installed)
            .finish()
    }
}
