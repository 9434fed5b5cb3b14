//! Privilege-scoped real-time scheduling and memory locking.
//!
//! A player process typically starts set-uid root (or with file
//! capabilities) but should spend its life running as the invoking user.
//! [`RealtimeController`] implements the round trip:
//!
//! ```text
//!  Normal --lower_privileges--> Lowered --enter_real_time--> RealTimeActive
//!                                  ^                              |
//!                                  +-------leave_real_time--------+
//! ```
//!
//! Entering and leaving briefly re-raise the effective user and group ids
//! to the ones captured by `lower_privileges`, perform the scheduler and
//! memory-lock calls, and drop back to the real ids before returning.
//!
//! OS access goes through [`SystemOps`] so the state machine can be driven
//! against a mock.

use fsk_common::config::RealtimeConfig;
use fsk_common::error::{FskError, FskResult};
use nix::errno::Errno;
use nix::unistd::{Gid, Uid};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Default number of stack bytes touched on entry to real-time mode.
pub const DEFAULT_PREFAULT_STACK_SIZE: usize = 100_000;

/// Real and effective user/group identifiers of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Real user id.
    pub uid: Uid,
    /// Effective user id.
    pub euid: Uid,
    /// Real group id.
    pub gid: Gid,
    /// Effective group id.
    pub egid: Gid,
}

/// Scheduler policy classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedPolicy {
    /// SCHED_OTHER: default time-shared scheduling.
    Other,
    /// SCHED_FIFO: first-in-first-out real-time.
    Fifo,
    /// SCHED_RR: round-robin real-time.
    RoundRobin,
    /// SCHED_BATCH: CPU-bound batch work.
    Batch,
    /// SCHED_IDLE: very low priority background work.
    Idle,
    /// A policy this crate does not name, by raw value.
    Raw(i32),
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other => write!(f, "SCHED_OTHER"),
            Self::Fifo => write!(f, "SCHED_FIFO"),
            Self::RoundRobin => write!(f, "SCHED_RR"),
            Self::Batch => write!(f, "SCHED_BATCH"),
            Self::Idle => write!(f, "SCHED_IDLE"),
            Self::Raw(raw) => write!(f, "policy {raw}"),
        }
    }
}

/// Scheduler policy plus static priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    /// Scheduling class.
    pub policy: SchedPolicy,
    /// Static priority within the class (0 for non-RT classes).
    pub priority: i32,
}

/// Operating system primitives needed by [`RealtimeController`].
pub trait SystemOps {
    /// Current real and effective identifiers.
    fn identity(&self) -> Identity;

    /// Set the effective user id.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the change is refused.
    fn set_effective_uid(&mut self, uid: Uid) -> nix::Result<()>;

    /// Set the effective group id.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the change is refused.
    fn set_effective_gid(&mut self, gid: Gid) -> nix::Result<()>;

    /// Scheduler policy and priority of the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the query fails.
    fn scheduler(&self) -> nix::Result<SchedParams>;

    /// Install a scheduler policy and priority on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error, typically `EPERM` without privileges.
    fn set_scheduler(&mut self, params: SchedParams) -> nix::Result<()>;

    /// Inclusive `(min, max)` static priority range of `policy`.
    ///
    /// # Errors
    ///
    /// Returns the OS error for an unknown policy.
    fn priority_range(&self, policy: SchedPolicy) -> nix::Result<(i32, i32)>;

    /// Lock all currently resident pages.
    ///
    /// # Errors
    ///
    /// Returns the OS error, typically `EPERM` or `ENOMEM`.
    fn lock_memory(&mut self) -> nix::Result<()>;
}

/// [`SystemOps`] backed by the host kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSystem;

impl SystemOps for HostSystem {
    fn identity(&self) -> Identity {
        use nix::unistd::{getegid, geteuid, getgid, getuid};

        Identity {
            uid: getuid(),
            euid: geteuid(),
            gid: getgid(),
            egid: getegid(),
        }
    }

    fn set_effective_uid(&mut self, uid: Uid) -> nix::Result<()> {
        nix::unistd::seteuid(uid)
    }

    fn set_effective_gid(&mut self, gid: Gid) -> nix::Result<()> {
        nix::unistd::setegid(gid)
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn scheduler(&self) -> nix::Result<SchedParams> {
        // SAFETY: pid 0 selects the calling thread; no pointers involved.
        let policy = Errno::result(unsafe { libc::sched_getscheduler(0) })?;
        let mut param = libc::sched_param { sched_priority: 0 };
        // SAFETY: `param` is a valid, writable sched_param.
        Errno::result(unsafe { libc::sched_getparam(0, &mut param) })?;
        Ok(SchedParams {
            policy: linux::policy_from_raw(policy),
            priority: param.sched_priority,
        })
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn set_scheduler(&mut self, params: SchedParams) -> nix::Result<()> {
        let param = libc::sched_param {
            sched_priority: params.priority,
        };
        // SAFETY: `param` is a valid sched_param; pid 0 is the calling thread.
        let rc = unsafe { libc::sched_setscheduler(0, linux::policy_to_raw(params.policy), &param) };
        Errno::result(rc).map(drop)
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn priority_range(&self, policy: SchedPolicy) -> nix::Result<(i32, i32)> {
        let raw = linux::policy_to_raw(policy);
        // SAFETY: plain integer queries.
        let min = Errno::result(unsafe { libc::sched_get_priority_min(raw) })?;
        // SAFETY: as above.
        let max = Errno::result(unsafe { libc::sched_get_priority_max(raw) })?;
        Ok((min, max))
    }

    #[cfg(target_os = "linux")]
    fn lock_memory(&mut self) -> nix::Result<()> {
        use nix::sys::mman::{mlockall, MlockAllFlags};

        mlockall(MlockAllFlags::MCL_CURRENT)
    }

    #[cfg(not(target_os = "linux"))]
    fn scheduler(&self) -> nix::Result<SchedParams> {
        Err(Errno::ENOSYS)
    }

    #[cfg(not(target_os = "linux"))]
    fn set_scheduler(&mut self, _params: SchedParams) -> nix::Result<()> {
        warn!("Real-time scheduling not available on this platform");
        Err(Errno::ENOSYS)
    }

    #[cfg(not(target_os = "linux"))]
    fn priority_range(&self, _policy: SchedPolicy) -> nix::Result<(i32, i32)> {
        Err(Errno::ENOSYS)
    }

    #[cfg(not(target_os = "linux"))]
    fn lock_memory(&mut self) -> nix::Result<()> {
        warn!("mlockall not available on this platform");
        Err(Errno::ENOSYS)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::SchedPolicy;

    pub(super) fn policy_from_raw(raw: i32) -> SchedPolicy {
        match raw {
            libc::SCHED_OTHER => SchedPolicy::Other,
            libc::SCHED_FIFO => SchedPolicy::Fifo,
            libc::SCHED_RR => SchedPolicy::RoundRobin,
            libc::SCHED_BATCH => SchedPolicy::Batch,
            libc::SCHED_IDLE => SchedPolicy::Idle,
            other => SchedPolicy::Raw(other),
        }
    }

    pub(super) fn policy_to_raw(policy: SchedPolicy) -> i32 {
        match policy {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Batch => libc::SCHED_BATCH,
            SchedPolicy::Idle => libc::SCHED_IDLE,
            SchedPolicy::Raw(raw) => raw,
        }
    }
}

/// Externally visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeState {
    /// Identifiers untouched.
    Normal,
    /// Effective ids set to the real ids; the originals are remembered.
    Lowered,
    /// Round-robin policy installed; the previous policy is remembered.
    RealTimeActive,
}

impl fmt::Display for PrivilegeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Lowered => write!(f, "LOWERED"),
            Self::RealTimeActive => write!(f, "REALTIME_ACTIVE"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Session {
    Normal,
    Lowered { ids: Identity },
    RealTimeActive { ids: Identity, previous: SchedParams },
}

/// Result of [`RealtimeController::enter_real_time`].
#[derive(Debug, Clone)]
pub struct RealtimeStatus {
    /// Whether the round-robin policy was installed.
    pub scheduler_installed: bool,
    /// Priority requested from the OS (after clamping).
    pub priority: i32,
    /// Scheduler state captured before entry.
    pub previous: SchedParams,
    /// Whether resident memory was locked.
    pub memory_locked: bool,
    /// Stack bytes pre-faulted.
    pub stack_prefaulted: usize,
}

/// Owns the process privilege/scheduling round trip.
///
/// One controller per process, driven from a single thread. Dropping a
/// controller that is still in real-time mode restores the previous
/// scheduler policy.
#[derive(Debug)]
pub struct RealtimeController<S: SystemOps = HostSystem> {
    sys: S,
    session: Session,
    lock_memory: bool,
    prefault_stack_size: usize,
}

impl RealtimeController<HostSystem> {
    /// Controller for the host kernel with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_system(HostSystem)
    }

}

impl Default for RealtimeController<HostSystem> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SystemOps> RealtimeController<S> {
    /// Controller over an arbitrary [`SystemOps`].
    pub fn with_system(sys: S) -> Self {
        Self {
            sys,
            session: Session::Normal,
            lock_memory: true,
            prefault_stack_size: DEFAULT_PREFAULT_STACK_SIZE,
        }
    }

    /// Enable or disable `mlockall` on entry.
    #[must_use]
    pub fn with_memory_lock(mut self, lock_memory: bool) -> Self {
        self.lock_memory = lock_memory;
        self
    }

    /// Stack bytes to touch on entry.
    #[must_use]
    pub fn with_prefault_stack_size(mut self, size: usize) -> Self {
        self.prefault_stack_size = size;
        self
    }

    /// Current state.
    pub fn state(&self) -> PrivilegeState {
        match self.session {
            Session::Normal => PrivilegeState::Normal,
            Session::Lowered { .. } => PrivilegeState::Lowered,
            Session::RealTimeActive { .. } => PrivilegeState::RealTimeActive,
        }
    }

    /// Identifiers captured by [`lower_privileges`](Self::lower_privileges).
    pub fn captured_identity(&self) -> Option<Identity> {
        match self.session {
            Session::Normal => None,
            Session::Lowered { ids } | Session::RealTimeActive { ids, .. } => Some(ids),
        }
    }

    /// Scheduler state that [`leave_real_time`](Self::leave_real_time) will restore.
    pub fn scheduling_snapshot(&self) -> Option<SchedParams> {
        match self.session {
            Session::RealTimeActive { previous, .. } => Some(previous),
            _ => None,
        }
    }

    /// The underlying system interface.
    pub fn system(&self) -> &S {
        &self.sys
    }

    /// Capture the current identifiers and set effective = real.
    ///
    /// # Errors
    ///
    /// Returns [`FskError::IdentityChange`] if the OS refuses the change; the
    /// caller should treat it as fatal. Returns
    /// [`FskError::InvalidStateTransition`] if privileges were already lowered.
    pub fn lower_privileges(&mut self) -> FskResult<()> {
        if !matches!(self.session, Session::Normal) {
            return Err(self.invalid_transition(PrivilegeState::Lowered));
        }

        let ids = self.sys.identity();
        debug!(
            uid = ids.uid.as_raw(),
            euid = ids.euid.as_raw(),
            gid = ids.gid.as_raw(),
            egid = ids.egid.as_raw(),
            "Lowering privileges"
        );
        self.drop_to_real(&ids)?;
        self.session = Session::Lowered { ids };
        info!(uid = ids.uid.as_raw(), gid = ids.gid.as_raw(), "Privileges lowered");
        Ok(())
    }

    /// Install round-robin scheduling at `max - priority` and lock memory.
    ///
    /// Only valid after [`lower_privileges`](Self::lower_privileges). The
    /// effective ids are raised for the duration of the call and dropped
    /// again before it returns. A refused policy change or memory lock is
    /// logged and reported in the status, not returned as an error.
    ///
    /// `priority` is an offset below the class maximum; the result is
    /// clamped into the range the OS reports for `SCHED_RR`.
    ///
    /// # Errors
    ///
    /// - [`FskError::InvalidStateTransition`] outside the `Lowered` state.
    /// - [`FskError::IdentityChange`] if the ids cannot be raised or dropped (fatal).
    /// - [`FskError::Scheduler`] if the current scheduler state cannot be read.
    pub fn enter_real_time(&mut self, priority: u8) -> FskResult<RealtimeStatus> {
        let Session::Lowered { ids } = self.session else {
            return Err(self.invalid_transition(PrivilegeState::RealTimeActive));
        };

        self.elevate(&ids)?;
        let outcome = self.install_realtime(priority);

        // Record the snapshot before dropping ids so a failed drop still
        // leaves something for leave_real_time or Drop to restore.
        if let Ok(status) = &outcome {
            if status.scheduler_installed {
                self.session = Session::RealTimeActive {
                    ids,
                    previous: status.previous,
                };
            }
        }

        self.drop_to_real(&ids)?;
        outcome
    }

    /// Apply memory-lock and pre-fault settings from `config`.
    ///
    /// Takes effect on the next [`enter_real_time`](Self::enter_real_time).
    pub fn configure(&mut self, config: &RealtimeConfig) {
        self.lock_memory = config.lock_memory;
        self.prefault_stack_size = config.prefault_stack_size;
    }

    /// Restore the scheduler state captured on entry.
    ///
    /// A no-op when real-time mode was never successfully entered.
    ///
    /// # Panics
    ///
    /// Panics if called before [`lower_privileges`](Self::lower_privileges);
    /// that is a programming error.
    ///
    /// # Errors
    ///
    /// Returns [`FskError::Restore`] if raising ids, restoring the scheduler,
    /// or dropping ids fails. The process may continue; scheduling state
    /// may be inconsistent.
    pub fn leave_real_time(&mut self) -> FskResult<()> {
        assert!(
            !matches!(self.session, Session::Normal),
            "contract violation: leave_real_time called before lower_privileges"
        );

        let Session::RealTimeActive { ids, previous } = self.session else {
            debug!("Real-time mode not active, nothing to restore");
            return Ok(());
        };

        self.elevate(&ids)
            .map_err(|e| FskError::Restore(e.to_string()))?;

        let restored = self.sys.set_scheduler(previous);
        let dropped = self.drop_to_real(&ids);

        if let Err(e) = restored {
            error!(policy = %previous.policy, priority = previous.priority, %e, "Error restoring scheduler");
            return Err(FskError::Restore(format!(
                "sched_setscheduler({}, {}) failed: {e}",
                previous.policy, previous.priority
            )));
        }
        dropped.map_err(|e| FskError::Restore(e.to_string()))?;

        self.session = Session::Lowered { ids };
        info!(policy = %previous.policy, priority = previous.priority, "Left real-time scheduling");
        Ok(())
    }

    fn install_realtime(&mut self, priority: u8) -> FskResult<RealtimeStatus> {
        let previous = self
            .sys
            .scheduler()
            .map_err(|e| FskError::Scheduler(format!("cannot get scheduler parameters: {e}")))?;
        let (min, max) = self
            .sys
            .priority_range(SchedPolicy::RoundRobin)
            .map_err(|e| FskError::Scheduler(format!("cannot get SCHED_RR priority range: {e}")))?;

        let requested = max - i32::from(priority);
        let clamped = requested.clamp(min, max);
        if clamped != requested {
            warn!(requested, clamped, min, max, "Scheduler priority clamped to valid range");
        }

        let scheduler_installed = match self.sys.set_scheduler(SchedParams {
            policy: SchedPolicy::RoundRobin,
            priority: clamped,
        }) {
            Ok(()) => {
                info!(priority = clamped, "Activated real-time scheduling");
                true
            }
            Err(e) => {
                warn!(
                    %e,
                    "Cannot set real-time scheduling - run as root or with CAP_SYS_NICE"
                );
                false
            }
        };

        let stack_prefaulted = prefault_stack(self.prefault_stack_size);

        let memory_locked = if self.lock_memory {
            match self.sys.lock_memory() {
                Ok(()) => {
                    info!("mlockall succeeded");
                    true
                }
                Err(e) => {
                    warn!(%e, "mlockall failed - page faults may add latency");
                    false
                }
            }
        } else {
            false
        };

        Ok(RealtimeStatus {
            scheduler_installed,
            priority: clamped,
            previous,
            memory_locked,
            stack_prefaulted,
        })
    }

    /// Raise effective ids to the captured ones. A half-finished raise is
    /// rolled back.
    fn elevate(&mut self, ids: &Identity) -> FskResult<()> {
        self.sys
            .set_effective_uid(ids.euid)
            .map_err(|e| identity_error(format!("set euid back to {}", ids.euid), e))?;
        if let Err(e) = self.sys.set_effective_gid(ids.egid) {
            if let Err(rollback) = self.sys.set_effective_uid(ids.uid) {
                error!(%rollback, uid = ids.uid.as_raw(), "Cannot roll back euid");
            }
            return Err(identity_error(format!("set egid back to {}", ids.egid), e));
        }
        Ok(())
    }

    /// Set effective ids to the real ones, group first.
    fn drop_to_real(&mut self, ids: &Identity) -> FskResult<()> {
        self.sys
            .set_effective_gid(ids.gid)
            .map_err(|e| identity_error(format!("set egid to {}", ids.gid), e))?;
        self.sys
            .set_effective_uid(ids.uid)
            .map_err(|e| identity_error(format!("set euid to {}", ids.uid), e))
    }

    fn invalid_transition(&self, to: PrivilegeState) -> FskError {
        FskError::InvalidStateTransition {
            from: self.state().to_string(),
            to: to.to_string(),
        }
    }
}

impl<S: SystemOps> Drop for RealtimeController<S> {
    fn drop(&mut self) {
        if matches!(self.session, Session::RealTimeActive { .. }) {
            warn!("Controller dropped in real-time mode, restoring scheduler");
            if let Err(e) = self.leave_real_time() {
                error!(%e, "Failed to restore scheduler on drop");
            }
        }
    }
}

fn identity_error(action: String, errno: Errno) -> FskError {
    error!(%action, %errno, "Identity change refused");
    FskError::IdentityChange {
        action,
        reason: errno.desc().to_string(),
    }
}

/// Touch `size` bytes of stack so the pages are resident before the
/// time-critical section.
///
/// Stack is touched one page-sized frame at a time; a remainder smaller
/// than a frame is ignored. Returns the number of bytes touched.
pub fn prefault_stack(size: usize) -> usize {
    const MAX_FRAMES: usize = 1000;

    let frames = (size / STACK_FRAME).min(MAX_FRAMES);
    if frames == 0 {
        return 0;
    }
    let touched = touch_stack_frames(frames) * STACK_FRAME;
    debug!(requested = size, touched, "Stack pre-fault complete");
    touched
}

const STACK_FRAME: usize = 4096;

/// Recurse `frames` deep, dirtying one frame-sized local per level.
#[inline(never)]
fn touch_stack_frames(frames: usize) -> usize {
    if frames == 0 {
        return 0;
    }
    let mut frame = [0u8; STACK_FRAME];
    frame[0] = 0x5A;
    frame[STACK_FRAME - 1] = 0xA5;
    std::hint::black_box(&mut frame);
    1 + touch_stack_frames(frames - 1)
}

/// Check if the current process is likely to get real-time privileges.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn check_rt_capabilities() -> RtCapabilities {
    let mut caps = RtCapabilities {
        is_root: nix::unistd::geteuid().is_root(),
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }
    // SAFETY: as above.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    caps
}

/// Check if the current process is likely to get real-time privileges.
#[cfg(not(target_os = "linux"))]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities {
        is_root: nix::unistd::geteuid().is_root(),
        ..Default::default()
    }
}

/// Real-time capabilities of the current process.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Whether the effective uid is root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO soft limit.
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK soft limit.
    pub memlock_limit: Option<u64>,
}

impl RtCapabilities {
    /// Check if RT scheduling is likely to succeed.
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Check if memory locking is likely to succeed.
    pub fn can_lock_memory(&self) -> bool {
        if self.is_root {
            return true;
        }

        #[cfg(target_os = "linux")]
        {
            self.memlock_limit.is_some_and(|l| l == libc::RLIM_INFINITY)
        }

        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}
