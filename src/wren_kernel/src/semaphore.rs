//! Counting semaphores
//!
//! A semaphore owns one embedded [`Condition`]; obtain and release are
//! expressed as suspend/resume on it. The release path wakes exactly
//! `count` waiters through a counting resume predicate, which is the
//! correct generalisation of binary-semaphore wake-one.
use core::fmt;

use crate::{
    error::{ObtainSemaphoreError, ResultCode},
    klock::{self, CpuLockCell, CpuLockTokenRef, CpuLockTokenRefMut},
    state, task, task_cb_by_id,
    utils::Init,
    wait::{self, CondLockHooks, Condition, Resume, ResumeParam, Suspend, SuspendParam},
    KernelTraits, Port, System, TaskId, Tick, MAX_WAIT,
};

/// A counting semaphore. Caller-provided (statically allocated or embedded
/// in a larger struct) and attached to the kernel by [`Self::create`].
pub struct Semaphore<Traits: Port> {
    count: CpuLockCell<Traits, u8>,
    max_count: CpuLockCell<Traits, u8>,
    owner: CpuLockCell<Traits, Option<TaskId>>,
    interrupt_protected: CpuLockCell<Traits, bool>,
    condition: Condition<Traits>,
}

impl<Traits: Port> Init for Semaphore<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        count: Init::INIT,
        max_count: Init::INIT,
        owner: Init::INIT,
        interrupt_protected: Init::INIT,
        condition: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .field("max_count", &self.max_count)
            .finish()
    }
}

/// Suspend iff no permit is available.
fn sem_do_suspend<Traits: KernelTraits>(
    token: CpuLockTokenRef<'_, Traits>,
    data: usize,
    _param: &SuspendParam,
) -> bool {
    // Safety: `data` was set by `create` to the semaphore's address; the
    // caller-owned semaphore outlives its waiters
    let semaphore = unsafe { &*(data as *const Semaphore<Traits>) };
    semaphore.count.get(&*token) == 0
}

/// Wake as many waiters as there are permits, and no more.
fn sem_do_resume(param: &mut ResumeParam, _suspend: &SuspendParam) -> bool {
    match param {
        ResumeParam::Count(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Initialize the semaphore with `count = max_count`.
    pub fn create(&'static self, max_count: u8) {
        let mut lock =
            klock::lock_cpu::<Traits>().expect("semaphore_create with CPU Lock active");
        assert!(
            !self.condition.has_waiters(lock.borrow_mut()),
            "semaphore is in use"
        );
        self.count.replace(&mut *lock, max_count);
        self.max_count.replace(&mut *lock, max_count);
        self.owner.replace(&mut *lock, None);
        self.interrupt_protected.replace(&mut *lock, false);
        self.condition.init_locked(
            lock.borrow_mut(),
            self as *const Self as usize,
            Some(sem_do_suspend::<Traits>),
        );
    }

    /// Register an interrupt lock/unlock pair for a semaphore whose resource
    /// is shared with an ISR. Rather than disabling all interrupts, obtain
    /// and release will mask only the one interrupt the pair controls.
    ///
    /// Only valid for a binary semaphore that is not currently obtained.
    pub fn set_interrupt_data(&'static self, data: usize, lock_fn: fn(usize), unlock_fn: fn(usize)) {
        System::<Traits>::scheduler_lock();
        {
            let mut lock =
                klock::lock_cpu::<Traits>().expect("set_interrupt_data with CPU Lock active");
            assert_eq!(
                self.count.get(&*lock),
                self.max_count.get(&*lock),
                "semaphore is currently obtained"
            );
            assert_eq!(
                self.max_count.get(&*lock),
                1,
                "interrupt protection requires max_count == 1"
            );
            self.interrupt_protected.replace(&mut *lock, true);
            self.condition.set_lock_hooks_locked(
                lock.borrow_mut(),
                CondLockHooks {
                    lock: lock_fn,
                    unlock: unlock_fn,
                    data,
                },
            );
        }
        System::<Traits>::scheduler_unlock();
    }

    /// Acquire a permit, waiting up to `wait` ticks ([`MAX_WAIT`] waits
    /// forever, `0` never blocks).
    pub fn obtain(&'static self, wait_ticks: Tick) -> Result<(), ObtainSemaphoreError> {
        System::<Traits>::scheduler_lock();
        let result = self.obtain_inner(wait_ticks);
        System::<Traits>::scheduler_unlock();
        result
    }

    fn obtain_inner(&'static self, wait_ticks: Tick) -> Result<(), ObtainSemaphoreError> {
        // The deadline is absolute, so retries share it
        #[cfg(feature = "sleep")]
        let deadline = (wait_ticks != MAX_WAIT)
            .then(|| System::<Traits>::current_system_tick().wrapping_add(wait_ticks));

        loop {
            {
                let mut lock = klock::lock_cpu::<Traits>()?;
                if self.max_count.get(&*lock) == 0 {
                    // Destroyed (or never created)
                    return Err(ObtainSemaphoreError::Deleted);
                }
                let count = self.count.get(&*lock);
                if count > 0 {
                    self.take(lock.borrow_mut());
                    return Ok(());
                }
                if wait_ticks == 0 || state::expect_waitable_context::<Traits>().is_err() {
                    return Err(ObtainSemaphoreError::Busy);
                }
            }

            // No permit; park on the condition. The resume predicate
            // reserves a permit for every task it wakes, but a permit can
            // still be consumed by a higher-priority task that never
            // waited, hence the re-check loop.
            let mut suspend = Suspend::new(SuspendParam::None);
            #[cfg(feature = "sleep")]
            if let Some(at) = deadline {
                suspend = suspend.with_deadline(at);
            }
            let suspends = [suspend];
            let conditions = [&self.condition];
            match wait::suspend_condition(&conditions, &suspends, false) {
                Ok(_) => continue,
                Err(crate::error::SuspendConditionError::Timeout) => {
                    return Err(ObtainSemaphoreError::Timeout)
                }
                Err(crate::error::SuspendConditionError::Aborted(code)) => {
                    debug_assert_eq!(code, ResultCode::SEMAPHORE_DELETED);
                    return Err(ObtainSemaphoreError::Deleted);
                }
                Err(crate::error::SuspendConditionError::BadContext) => {
                    return Err(ObtainSemaphoreError::BadContext)
                }
            }
        }
    }

    /// Consume one permit. The count is known to be nonzero.
    fn take(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let count = self.count.get(&*lock);
        debug_assert!(count > 0);
        self.count.replace(&mut *lock, count - 1);
        let running_task = Traits::state().running_task.get(&*lock);
        self.owner.replace(&mut *lock, running_task);
        if self.interrupt_protected.get(&*lock) {
            if let Some(hooks) = self.condition.hooks(lock.borrow_mut()) {
                (hooks.lock)(hooks.data);
            }
        }
    }

    /// Return a permit and wake eligible waiters. Releasing a semaphore
    /// already at `max_count` is a programmer error and halts the kernel.
    pub fn release(&'static self) {
        System::<Traits>::scheduler_lock();
        {
            let mut lock =
                klock::lock_cpu::<Traits>().expect("semaphore_release with CPU Lock active");
            let count = self.count.get(&*lock);
            assert!(
                count < self.max_count.get(&*lock),
                "semaphore double release"
            );
            self.count.replace(&mut *lock, count + 1);
            self.owner.replace(&mut *lock, None);

            let mut resume = Resume {
                status: ResultCode::TASK_RESUME,
                do_resume: Some(sem_do_resume),
                param: ResumeParam::Count((count + 1) as u32),
            };
            wait::resume_condition_locked(lock.borrow_mut(), &self.condition, &mut resume);

            if self.interrupt_protected.get(&*lock) {
                if let Some(hooks) = self.condition.hooks(lock.borrow_mut()) {
                    (hooks.unlock)(hooks.data);
                }
            }
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
        }
        System::<Traits>::scheduler_unlock();
    }

    /// Tear the semaphore down, resuming every waiter with
    /// `SEMAPHORE_DELETED` and resetting the control block. Waiters must not
    /// touch the semaphore after observing that status.
    pub fn destroy(&'static self) {
        let mut lock =
            klock::lock_cpu::<Traits>().expect("semaphore_destroy with CPU Lock active");
        let mut resume = Resume {
            status: ResultCode::SEMAPHORE_DELETED,
            do_resume: None,
            param: ResumeParam::None,
        };
        wait::resume_condition_locked(lock.borrow_mut(), &self.condition, &mut resume);
        debug_assert!(!self.condition.has_waiters(lock.borrow_mut()));

        self.count.replace(&mut *lock, 0);
        self.max_count.replace(&mut *lock, 0);
        self.owner.replace(&mut *lock, None);
        self.interrupt_protected.replace(&mut *lock, false);
        self.condition.init_locked(lock.borrow_mut(), 0, None);

        task::unlock_cpu_and_check_preemption::<Traits>(lock);
    }

    /// The number of available permits.
    pub fn count(&self) -> u8 {
        let lock = klock::lock_cpu::<Traits>().expect("semaphore count with CPU Lock active");
        self.count.get(&*lock)
    }

    /// The task currently holding the last permit taken, if any.
    pub fn owner(&self) -> Option<TaskId> {
        let lock = klock::lock_cpu::<Traits>().expect("semaphore owner with CPU Lock active");
        self.owner.get(&*lock)
    }

    /// The name of the owning task, for diagnostics.
    pub fn owner_name(&self) -> Option<&'static str> {
        self.owner().map(|id| task_cb_by_id::<Traits>(id).attr().name)
    }
}
