//! The condition / suspend / resume primitive
//!
//! This is the unifying wait-point every blocking API delegates to.
//! Semaphores and the fd readiness layer are both expressed as clients.
//!
//! A [`Suspend`] record lives on the waiting task's stack for the duration
//! of one [`suspend_condition`] call and is linked into each condition's
//! waiter list by a raw handle. The call unlinks every record before it
//! returns, so a record can only expire once its task is not waiting
//! anymore; `Suspend::drop` panics if that invariant is ever broken.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{ResultCode, SuspendConditionError},
    klock::{self, CpuLockCell, CpuLockTokenRef, CpuLockTokenRefMut},
    state, task,
    task::{TaskSt, YieldReason},
    task_cb_by_id,
    utils::{
        list::{self, LinkAdapter, ListHead},
        Init,
    },
    KernelTraits, Port, Priority, TaskId,
};

#[cfg(feature = "sleep")]
use crate::{sleep, Tick};

bitflags::bitflags! {
    struct CondFlags: u8 {
        /// One-shot edge signal set by an ISR producer and consumed by the
        /// next resume.
        const PING = 1 << 0;
    }
}

impl Init for CondFlags {
    const INIT: Self = Self::empty();
}

/// Decides whether a task must actually wait on a condition. Receives the
/// condition's resource word and the waiter's [`SuspendParam`]; returns
/// `false` when the awaited state already holds, ending the wait before it
/// starts.
pub type DoSuspendFn<Traits> =
    for<'a, 'b> fn(CpuLockTokenRef<'a, Traits>, usize, &'b SuspendParam) -> bool;

/// Selects which suspended tasks a resume applies to. Receives the
/// producer's mutable [`ResumeParam`] (so it can count permits) and the
/// waiter's [`SuspendParam`].
pub type DoResumeFn = fn(&mut ResumeParam, &SuspendParam) -> bool;

/// Describes *what* a task is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendParam {
    None,
    /// A readiness-criteria bit mask (see the fd layer).
    Criteria(u32),
}

/// The producer-side parameter handed to [`DoResumeFn`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeParam {
    None,
    /// Wake at most this many waiters.
    Count(u32),
    /// Wake waiters whose criteria overlap this mask.
    Criteria(u32),
}

/// The per-wake parameterisation handed to a producer.
pub struct Resume {
    /// Delivered to every resumed task.
    pub status: ResultCode,
    /// Optional filter; `None` wakes every waiter.
    pub do_resume: Option<DoResumeFn>,
    pub param: ResumeParam,
}

/// Lock/unlock callbacks used when a condition is protected by something
/// other than the global scheduler lock (an interrupt mask, an fd lock).
#[derive(Clone, Copy)]
pub struct CondLockHooks {
    pub lock: fn(usize),
    pub unlock: fn(usize),
    pub data: usize,
}

impl fmt::Debug for CondLockHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondLockHooks")
            .field("data", &self.data)
            .finish()
    }
}

/// A reference to a [`Suspend`].
pub(crate) struct SuspendRef<Traits: Port>(NonNull<Suspend<Traits>>);

// Safety: `Suspend` is `Send + Sync`
unsafe impl<Traits: Port> Send for SuspendRef<Traits> {}
unsafe impl<Traits: Port> Sync for SuspendRef<Traits> {}

impl<Traits: Port> Clone for SuspendRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: Port> Copy for SuspendRef<Traits> {}

impl<Traits: Port> PartialEq for SuspendRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: Port> Eq for SuspendRef<Traits> {}

impl<Traits: Port> fmt::Debug for SuspendRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SuspendRef").field(&self.0).finish()
    }
}

/// A wait-point. The resource owns the condition, never the other way
/// around; `data` carries whatever word the resource's predicates need to
/// find it again.
pub struct Condition<Traits: Port> {
    /// Waiter records sorted by wait priority, FIFO within a priority.
    /// Every element points to a live [`Suspend`].
    waiters: CpuLockCell<Traits, ListHead<SuspendRef<Traits>>>,

    flags: CpuLockCell<Traits, CondFlags>,

    /// Identifies the underlying resource; passed to [`DoSuspendFn`].
    data: CpuLockCell<Traits, usize>,

    do_suspend: CpuLockCell<Traits, Option<DoSuspendFn<Traits>>>,

    lock_hooks: CpuLockCell<Traits, Option<CondLockHooks>>,
}

impl<Traits: Port> Init for Condition<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waiters: Init::INIT,
        flags: Init::INIT,
        data: Init::INIT,
        do_suspend: Init::INIT,
        lock_hooks: Init::INIT,
    };
}

impl<Traits: KernelTraits> Condition<Traits> {
    /// Attach the condition to its resource.
    pub fn init(&self, data: usize, do_suspend: Option<DoSuspendFn<Traits>>) {
        let mut lock = klock::lock_cpu::<Traits>().expect("Condition::init with CPU Lock active");
        self.init_locked(lock.borrow_mut(), data, do_suspend);
    }

    pub(crate) fn init_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        data: usize,
        do_suspend: Option<DoSuspendFn<Traits>>,
    ) {
        debug_assert!(self.waiters.get(&*lock).is_empty());
        self.data.replace(&mut *lock, data);
        self.do_suspend.replace(&mut *lock, do_suspend);
        self.flags.replace(&mut *lock, CondFlags::empty());
        self.lock_hooks.replace(&mut *lock, None);
    }

    /// Protect the condition with a caller-supplied lock pair instead of the
    /// scheduler lock.
    pub fn set_lock_hooks(&self, hooks: CondLockHooks) {
        let mut lock =
            klock::lock_cpu::<Traits>().expect("Condition::set_lock_hooks with CPU Lock active");
        self.set_lock_hooks_locked(lock.borrow_mut(), hooks);
    }

    pub(crate) fn set_lock_hooks_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        hooks: CondLockHooks,
    ) {
        self.lock_hooks.replace(&mut *lock, Some(hooks));
    }

    /// Raise the one-shot edge signal. Used by edge-triggered ISR producers
    /// before the resume that consumes it.
    pub fn ping(&self) {
        let mut lock = klock::lock_cpu::<Traits>().expect("Condition::ping with CPU Lock active");
        self.ping_locked(lock.borrow_mut());
    }

    pub(crate) fn ping_locked(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let flags = self.flags.get(&*lock);
        self.flags.replace(&mut *lock, flags | CondFlags::PING);
    }

    pub(crate) fn has_waiters(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        !self.waiters.get(&*lock).is_empty()
    }

    pub(crate) fn hooks(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<CondLockHooks> {
        self.lock_hooks.get(&*lock)
    }
}

impl<Traits: KernelTraits> fmt::Debug for Condition<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("self", &(self as *const _))
            .field("data", &self.data)
            .finish()
    }
}

/// The per-waiter parameterisation of one wait. Constructed on the waiting
/// task's stack and valid only for the duration of one
/// [`suspend_condition`] call.
pub struct Suspend<Traits: Port> {
    param: SuspendParam,

    /// Wait priority override. Defaults to the suspending task's priority.
    priority: Option<Priority>,

    /// Absolute deadline in ticks.
    #[cfg(feature = "sleep")]
    deadline: Option<Tick>,

    /// Written by the waker; `None` means no producer resumed this record
    /// (the wait ended by timeout or on another condition).
    status: CpuLockCell<Traits, Option<ResultCode>>,

    /// The priority the record was queued with.
    eff_priority: CpuLockCell<Traits, Priority>,

    /// Forms the waiter list of the condition this record is queued on.
    link: CpuLockCell<Traits, Option<SuspendRef<Traits>>>,

    /// The waiting task. `None` once the record is dissected.
    task: CpuLockCell<Traits, Option<TaskId>>,

    /// Whether the record is currently linked into a waiter list.
    queued: CpuLockCell<Traits, bool>,
}

impl<Traits: Port> Suspend<Traits> {
    pub fn new(param: SuspendParam) -> Self {
        Self {
            param,
            priority: None,
            #[cfg(feature = "sleep")]
            deadline: None,
            status: CpuLockCell::new(None),
            eff_priority: CpuLockCell::new(0),
            link: CpuLockCell::new(None),
            task: CpuLockCell::new(None),
            queued: CpuLockCell::new(false),
        }
    }

    /// Order this wait ahead of (or behind) others regardless of the task's
    /// scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Give the wait an absolute deadline. The task is installed on the
    /// sleep queue alongside the waiter lists; whichever fires first wins.
    #[cfg(feature = "sleep")]
    pub fn with_deadline(mut self, wake_at: Tick) -> Self {
        self.deadline = Some(wake_at);
        self
    }

    pub fn param(&self) -> &SuspendParam {
        &self.param
    }

    /// The status written by the waker, if any. Meaningful after
    /// `suspend_condition` returns.
    pub fn status(&self) -> Option<ResultCode> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        self.status.get(&*lock)
    }
}

impl<Traits: Port> Drop for Suspend<Traits> {
    fn drop(&mut self) {
        if *self.queued.get_mut() {
            // A queued record that is dropped would leave a dangling handle
            // in a waiter list
            panic!("suspend record is still queued");
        }
    }
}

impl<Traits: Port> fmt::Debug for Suspend<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspend")
            .field("param", &self.param)
            .field("priority", &self.priority)
            .finish()
    }
}

struct WaitLinks<'a, Traits: Port> {
    token: CpuLockTokenRefMut<'a, Traits>,
}

impl<Traits: Port> LinkAdapter<SuspendRef<Traits>> for WaitLinks<'_, Traits> {
    fn next(&self, node: SuspendRef<Traits>) -> Option<SuspendRef<Traits>> {
        // Safety: every handle in a waiter list points to a live `Suspend`
        unsafe { node.0.as_ref() }.link.get(&*self.token)
    }
    fn set_next(&mut self, node: SuspendRef<Traits>, next: Option<SuspendRef<Traits>>) {
        // Safety: ditto
        unsafe { node.0.as_ref() }
            .link
            .replace(&mut *self.token, next);
    }
}

/// Unlink one record from `condition`'s waiter list.
fn unlink_suspend<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    condition: &Condition<Traits>,
    suspend_ref: SuspendRef<Traits>,
) {
    let mut head = condition.waiters.get(&*lock);
    {
        let mut links = WaitLinks::<Traits> {
            token: lock.borrow_mut(),
        };
        list::remove(&mut head, &mut links, suspend_ref);
    }
    condition.waiters.replace(&mut *lock, head);
    // Safety: the handle was just in the waiter list
    unsafe { suspend_ref.0.as_ref() }
        .queued
        .replace(&mut *lock, false);
}

/// Call every condition's lock callback in array order.
fn acquire_hooks<Traits: KernelTraits>(conditions: &[&Condition<Traits>]) {
    for condition in conditions {
        let hooks = {
            let mut lock = klock::lock_cpu::<Traits>().expect("condition hooks with CPU Lock active");
            condition.hooks(lock.borrow_mut())
        };
        if let Some(h) = hooks {
            (h.lock)(h.data);
        }
    }
}

/// Call every condition's unlock callback in reverse array order.
fn release_hooks<Traits: KernelTraits>(conditions: &[&Condition<Traits>]) {
    for condition in conditions.iter().rev() {
        let hooks = {
            let mut lock = klock::lock_cpu::<Traits>().expect("condition hooks with CPU Lock active");
            condition.hooks(lock.borrow_mut())
        };
        if let Some(h) = hooks {
            (h.unlock)(h.data);
        }
    }
}

/// Suspend the current task on up to N conditions simultaneously.
///
/// Returns the index of the condition whose predicate was already satisfied
/// or whose producer resumed the task. `locked_by_caller` tells whether the
/// caller already holds the conditions' locks (their lock callbacks); either
/// way the locks are released while the task is parked and re-acquired
/// before the call returns, leaving the caller's view unchanged.
pub fn suspend_condition<Traits: KernelTraits>(
    conditions: &[&Condition<Traits>],
    suspends: &[Suspend<Traits>],
    locked_by_caller: bool,
) -> Result<usize, SuspendConditionError> {
    assert_eq!(conditions.len(), suspends.len());
    assert!(!conditions.is_empty());
    state::expect_waitable_context::<Traits>()?;

    // Conditions are always locked in array order to preclude deadlock
    if !locked_by_caller {
        acquire_hooks::<Traits>(conditions);
    }

    let result = suspend_condition_inner(conditions, suspends);

    if !locked_by_caller {
        release_hooks::<Traits>(conditions);
    }
    result
}

fn suspend_condition_inner<Traits: KernelTraits>(
    conditions: &[&Condition<Traits>],
    suspends: &[Suspend<Traits>],
) -> Result<usize, SuspendConditionError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cur = Traits::state().running_task.get(&*lock).unwrap();
    let cur_cb = task_cb_by_id::<Traits>(cur);

    // A predicate that is already satisfied ends the wait before it starts
    for (i, condition) in conditions.iter().enumerate() {
        if let Some(do_suspend) = condition.do_suspend.get(&*lock) {
            let data = condition.data.get(&*lock);
            if !do_suspend(lock.borrow_mut().borrow(), data, &suspends[i].param) {
                return Ok(i);
            }
        }
    }

    // Queue every record, sorted by wait priority (FIFO within a priority)
    let default_pri = cur_cb.priority.get(&*lock);
    for (i, condition) in conditions.iter().enumerate() {
        let suspend = &suspends[i];
        suspend.task.replace(&mut *lock, Some(cur));
        suspend.status.replace(&mut *lock, None);
        suspend
            .eff_priority
            .replace(&mut *lock, suspend.priority.unwrap_or(default_pri));
        suspend.queued.replace(&mut *lock, true);

        let mut head = condition.waiters.get(&*lock);
        {
            let mut links = WaitLinks::<Traits> {
                token: lock.borrow_mut(),
            };
            list::insert_sorted(
                &mut head,
                &mut links,
                SuspendRef(NonNull::from(suspend)),
                |links, existing, new| {
                    // Safety: both handles are in (or being inserted into)
                    // the waiter list, so the pointees are alive
                    let e = unsafe { existing.0.as_ref() }.eff_priority.get(&*links.token);
                    let n = unsafe { new.0.as_ref() }.eff_priority.get(&*links.token);
                    e > n
                },
            );
        }
        condition.waiters.replace(&mut *lock, head);
    }

    // A timed wait is simultaneously on the sleep queue; the earliest
    // deadline across the array applies
    #[cfg(feature = "sleep")]
    {
        let now = Traits::state().tick_count.get(&*lock);
        let earliest = suspends
            .iter()
            .filter_map(|s| s.deadline)
            .min_by_key(|&at| sleep::tick_cmp(at, now));
        if let Some(at) = earliest {
            sleep::sleep_add_to_list_abs(lock.borrow_mut(), cur, at);
        }
    }

    // Park. The condition locks are released for the window so producers
    // (including the ones the locks mask) can run.
    cur_cb.st.replace(&mut *lock, TaskSt::ToBeSuspended);
    // Safety: we own the CPU Lock; it is re-acquired before any kernel cell
    // is touched again
    unsafe { Traits::leave_cpu_lock() };
    release_hooks::<Traits>(conditions);
    loop {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
        unsafe { Traits::enter_cpu_lock() };
        if cur_cb.st.get(&*lock) == TaskSt::Running {
            break;
        }
        unsafe { Traits::leave_cpu_lock() };
    }

    // Dissect the wait while the CPU Lock is still held: unlink whatever is
    // still queued, drop the sleep entry, and find which condition released
    // us. This must precede the lock re-acquisition below, which can block
    // and must not leave stale records for producers to trip over.
    let mut woken: Option<(usize, ResultCode)> = None;
    for (i, condition) in conditions.iter().enumerate() {
        let suspend = &suspends[i];
        if suspend.queued.get(&*lock) {
            unlink_suspend(lock.borrow_mut(), condition, SuspendRef(NonNull::from(suspend)));
        }
        suspend.task.replace(&mut *lock, None);
        if woken.is_none() {
            if let Some(code) = suspend.status.get(&*lock) {
                woken = Some((i, code));
            }
        }
    }
    #[cfg(feature = "sleep")]
    sleep::sleep_remove_from_list(lock.borrow_mut(), cur);
    drop(lock);

    // Restore the caller's view of the condition locks
    acquire_hooks::<Traits>(conditions);

    match woken {
        Some((i, code)) if !code.is_error() => Ok(i),
        Some((_, code)) => Err(SuspendConditionError::Aborted(code)),
        None => Err(SuspendConditionError::Timeout),
    }
}

/// Wake suspended tasks. Walks the waiter list head-to-tail; a waiter is
/// woken when `resume.do_resume` is absent or approves it. Ends by
/// consuming the one-shot `PING` signal.
///
/// This is the task-context entry point; it checks for preemption before
/// returning. Producers already holding the CPU Lock (ISRs, kernel
/// internals) use [`resume_condition_locked`].
pub fn resume_condition<Traits: KernelTraits>(
    condition: &Condition<Traits>,
    resume: &mut Resume,
) -> Result<(), crate::error::BadContextError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    resume_condition_locked(lock.borrow_mut(), condition, resume);
    task::unlock_cpu_and_check_preemption::<Traits>(lock);
    Ok(())
}

pub(crate) fn resume_condition_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    condition: &Condition<Traits>,
    resume: &mut Resume,
) {
    let mut cur = condition.waiters.get(&*lock).first;
    while let Some(suspend_ref) = cur {
        // Find the next record before possibly unlinking this one
        cur = {
            let links = WaitLinks::<Traits> {
                token: lock.borrow_mut(),
            };
            links.next(suspend_ref)
        };

        // Safety: the handle is in the waiter list, so the pointee is alive
        let suspend = unsafe { suspend_ref.0.as_ref() };

        let eligible = match resume.do_resume {
            Some(do_resume) => do_resume(&mut resume.param, &suspend.param),
            None => true,
        };
        if !eligible {
            continue;
        }

        unlink_suspend(lock.borrow_mut(), condition, suspend_ref);
        complete_suspend(lock.borrow_mut(), suspend, resume.status);
    }

    let flags = condition.flags.get(&*lock);
    if flags.contains(CondFlags::PING) {
        condition.flags.replace(&mut *lock, flags & !CondFlags::PING);
    }
}

/// Deliver `status` to the record's task and make the task ready.
///
/// This may make a task Ready but doesn't yield the processor; the caller
/// uses `unlock_cpu_and_check_preemption` as needed.
fn complete_suspend<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    suspend: &Suspend<Traits>,
    status: ResultCode,
) {
    let Some(task) = suspend.task.get(&*lock) else {
        return;
    };
    let task_cb = task_cb_by_id::<Traits>(task);
    match task_cb.st.get(&*lock) {
        TaskSt::Suspended => {
            suspend.status.replace(&mut *lock, Some(status));
            #[cfg(feature = "sleep")]
            sleep::sleep_remove_from_list(lock.borrow_mut(), task);
            task::yield_task(lock, task, YieldReason::System);
        }
        TaskSt::ToBeSuspended => {
            // The waiter has not been switched out yet; cancel the switch
            suspend.status.replace(&mut *lock, Some(status));
            #[cfg(feature = "sleep")]
            sleep::sleep_remove_from_list(lock.borrow_mut(), task);
            task_cb.st.replace(&mut *lock, TaskSt::Running);
        }
        // Already woken by another condition or by the tick drain; the
        // record was stale
        _ => {}
    }
}
