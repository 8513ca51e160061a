//! The idle task and deferred work
//!
//! The idle task is permanently scheduled at `SCHEDULER_MAX_PRI + 1`. Each
//! loop iteration traverses a fixed-capacity registry of `(fn, data)` pairs
//! and invokes every live entry. Whether the registry may change while the
//! kernel is running is a compile-time choice: with `idle_runtime_update`,
//! updates are guarded by an interlocked bit; without it, updates after
//! `kernel_run` are rejected with `IDLE_CANNOT_UPDATE`.
use core::fmt;

use crate::{
    error::IdleWorkError,
    klock::{self, CpuLockCell},
    utils::Init,
    KernelTraits, Port, System, TaskFlags,
};

#[cfg(feature = "idle_runtime_update")]
use core::sync::atomic::Ordering;

/// A deferred work item invoked repeatedly from the idle task.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdleWork {
    pub func: fn(usize),
    pub data: usize,
}

impl fmt::Debug for IdleWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleWork")
            .field("func", &(self.func as usize as *const ()))
            .field("data", &self.data)
            .finish()
    }
}

/// One registry slot. The application provides the pool through
/// [`KernelTraits::idle_work_pool`].
pub struct IdleWorkSlot<Traits: Port> {
    work: CpuLockCell<Traits, Option<IdleWork>>,
}

impl<Traits: Port> Init for IdleWorkSlot<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { work: Init::INIT };
}

#[cfg(feature = "idle_runtime_update")]
fn acquire_interlock<Traits: KernelTraits>() {
    let state = Traits::state();
    while state
        .idle_work_lock
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        // Sleep and hope the holder is done on the next try; busy-spin when
        // sleeping is not possible yet
        #[cfg(feature = "sleep")]
        if crate::state::expect_waitable_context::<Traits>().is_ok() {
            System::<Traits>::sleep_ticks(1);
            continue;
        }
        core::hint::spin_loop();
    }
}

#[cfg(feature = "idle_runtime_update")]
fn release_interlock<Traits: KernelTraits>() {
    Traits::state().idle_work_lock.store(false, Ordering::Release);
}

/// Read one slot consistently with concurrent registry updates.
fn snapshot_slot<Traits: KernelTraits>(slot: &IdleWorkSlot<Traits>) -> Option<IdleWork> {
    #[cfg(feature = "idle_runtime_update")]
    {
        acquire_interlock::<Traits>();
        let work = {
            let lock = klock::lock_cpu::<Traits>().expect("idle sweep with CPU Lock active");
            slot.work.get(&*lock)
        };
        release_interlock::<Traits>();
        work
    }
    #[cfg(not(feature = "idle_runtime_update"))]
    {
        let lock = klock::lock_cpu::<Traits>().expect("idle sweep with CPU Lock active");
        slot.work.get(&*lock)
    }
}

fn idle_task_entry<Traits: KernelTraits>(_arg: usize) {
    loop {
        for slot in Traits::idle_work_pool() {
            if let Some(work) = snapshot_slot::<Traits>(slot) {
                (work.func)(work.data);
            }
        }
        // The sweep boundary is also the idle task's preemption point
        System::<Traits>::task_yield();
    }
}

/// Create and schedule the idle task. Called once by `kernel_run`.
pub(crate) fn idle_task_init<Traits: KernelTraits>() {
    assert!(
        Traits::SCHEDULER_MAX_PRI < crate::Priority::MAX,
        "no priority level left for the idle task"
    );

    let id = System::<Traits>::task_create(
        "Idle",
        Traits::idle_task_stack(),
        idle_task_entry::<Traits>,
        0,
        TaskFlags::empty(),
    )
    .expect("no control block slot left for the idle task");

    {
        let mut lock = klock::lock_cpu::<Traits>().expect("idle init with CPU Lock active");
        Traits::state().idle_task.replace(&mut *lock, Some(id));
    }

    System::<Traits>::scheduler_task_add(id, Traits::SCHEDULER_MAX_PRI + 1);
}

impl<Traits: KernelTraits> System<Traits> {
    /// Register a deferred work item.
    pub fn idle_add_work(func: fn(usize), data: usize) -> Result<(), IdleWorkError> {
        #[cfg(not(feature = "idle_runtime_update"))]
        if Traits::state().is_running() {
            return Err(IdleWorkError::CannotUpdate);
        }
        #[cfg(feature = "idle_runtime_update")]
        acquire_interlock::<Traits>();

        let result = (|| {
            let mut lock = klock::lock_cpu::<Traits>().expect("idle_add_work with CPU Lock active");
            for slot in Traits::idle_work_pool() {
                if slot.work.get(&*lock).is_none() {
                    slot.work.replace(&mut *lock, Some(IdleWork { func, data }));
                    return Ok(());
                }
            }
            Err(IdleWorkError::NoSpace)
        })();

        #[cfg(feature = "idle_runtime_update")]
        release_interlock::<Traits>();
        result
    }

    /// Remove a previously registered work item.
    pub fn idle_remove_work(func: fn(usize), data: usize) -> Result<(), IdleWorkError> {
        #[cfg(not(feature = "idle_runtime_update"))]
        if Traits::state().is_running() {
            return Err(IdleWorkError::CannotUpdate);
        }
        #[cfg(feature = "idle_runtime_update")]
        acquire_interlock::<Traits>();

        let wanted = IdleWork { func, data };
        let result = (|| {
            let mut lock =
                klock::lock_cpu::<Traits>().expect("idle_remove_work with CPU Lock active");
            for slot in Traits::idle_work_pool() {
                if slot.work.get(&*lock) == Some(wanted) {
                    slot.work.replace(&mut *lock, None);
                    return Ok(());
                }
            }
            Err(IdleWorkError::NotFound)
        })();

        #[cfg(feature = "idle_runtime_update")]
        release_interlock::<Traits>();
        result
    }
}
