//! The Wren kernel core: a preemptive strict-priority scheduler, a unified
//! condition/suspend/resume primitive, counting semaphores with an
//! ISR-protected mode, the tick/sleep subsystem, and the fd readiness layer
//! that ties blocking I/O into the condition primitive.
//!
//! The kernel is generic over a [`Port`] — the handful of architecture
//! primitives it needs from the target — and over [`KernelTraits`], which
//! hands it its statically allocated storage. A port crate (such as
//! `wren_port_std`, the hosted simulation port) implements `Port` and
//! provides a macro that instantiates the storage.
//!
//! # Contexts
//!
//! *Task context* is code running on behalf of a task created by
//! [`System::task_create`]. *Interrupt context* is code running on behalf of
//! a hardware interrupt handler. Blocking APIs ([`System::sleep_ticks`],
//! [`Semaphore::obtain`] with a nonzero wait, blocking fd I/O,
//! [`suspend_condition`]) require a task context. Producer APIs
//! ([`resume_condition`], the `Fs` readiness notifications, semaphore
//! release on ISR-protected semaphores, [`PortToKernel::timer_tick`]) may be
//! used from interrupt context.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
mod klock;
mod state;
pub mod utils;

mod idle;
#[cfg(feature = "sleep")]
mod sleep;
mod task;
pub mod time;
mod wait;

#[cfg(feature = "semaphore")]
mod fs;
#[cfg(feature = "semaphore")]
mod semaphore;

use core::{fmt, marker::PhantomData, num::NonZeroUsize};

pub use crate::error::{
    BadContextError, CreateTaskError, FsError, IdleWorkError, ObtainSemaphoreError,
    PollTimeoutError, ResultCode, SuspendConditionError,
};
#[cfg(feature = "semaphore")]
pub use crate::fs::{FsFlags, FsNode, FsReadFn, FsWriteFn, FS_BLOCK_READ, FS_BLOCK_WRITE};
pub use crate::idle::{IdleWork, IdleWorkSlot};
#[cfg(feature = "semaphore")]
pub use crate::semaphore::Semaphore;
pub use crate::task::{
    task_id_of_cb, StackStorage, TaskAttr, TaskCb, TaskFlags, TaskSt, TaskStack, STACK_ALIGN,
    STACK_FILL_BYTE,
};
pub use crate::klock::CpuLockTokenRef;
pub use crate::wait::{
    resume_condition, suspend_condition, CondLockHooks, Condition, DoResumeFn, DoSuspendFn, Resume,
    ResumeParam, Suspend, SuspendParam,
};

use crate::utils::{list::ListHead, Init};

/// One increment of the monotonic scheduling counter.
pub type Tick = u32;

/// Task priority. Lower numeric values take precedence;
/// `SCHEDULER_MAX_PRI + 1` is reserved for the idle task.
pub type Priority = u8;

/// Wait forever.
pub const MAX_WAIT: Tick = Tick::MAX;

/// Identifies a task. One-based index into [`KernelTraits::task_cb_pool`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(NonZeroUsize);

impl TaskId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(NonZeroUsize::new(index + 1).unwrap())
    }

    /// The raw one-based value.
    pub fn get(self) -> usize {
        self.0.get()
    }

    pub(crate) fn index(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskId").field(&self.0.get()).finish()
    }
}

/// Get the task control block for a task id.
///
/// Panics if the id does not refer to the pool (ids are only minted by
/// `task_create`, so an out-of-range id is a programmer error).
pub fn task_cb_by_id<Traits: KernelTraits>(id: TaskId) -> &'static TaskCb<Traits> {
    &Traits::task_cb_pool()[id.index()]
}

/// Compile-time kernel configuration.
pub trait KernelCfg: 'static {
    /// The lowest-precedence priority available to user tasks. The idle task
    /// runs at `SCHEDULER_MAX_PRI + 1`.
    const SCHEDULER_MAX_PRI: Priority = 31;

    /// Maximum scheduler lock nesting depth. Exceeding it is a fatal
    /// assertion.
    const SCHEDULER_MAX_LOCK: u8 = 16;

    /// System tick frequency, used by the `ms ↔ tick` conversions.
    const TICKS_PER_SEC: u32 = 1000;

    /// Hardware (free-running) counter frequency in ticks per microsecond,
    /// used by the busy-wait helpers.
    const HW_TICKS_PER_US: u64 = 1;
}

/// The port contract: the architecture primitives the kernel requires from
/// the target. These are the only hardware touches in the core.
///
/// # Safety
///
/// Implementing this trait incorrectly (for example, a `leave_cpu_lock` that
/// doesn't restore interrupt delivery, or a `dispatch_first_task` that
/// returns) breaks the invariants the kernel's `unsafe` blocks rely on.
pub unsafe trait Port: KernelCfg + Sized + 'static {
    /// Port-specific per-task state embedded in [`TaskCb`], placed there so
    /// context-switch code can reach it from the control block.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// Enter the CPU Lock state (mask interrupts), waiting if another
    /// context currently owns it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn enter_cpu_lock();

    /// Leave the CPU Lock state.
    ///
    /// # Safety
    ///
    /// The current context must own the CPU Lock.
    unsafe fn leave_cpu_lock();

    /// Try to enter the CPU Lock state. Returns `false` iff the current
    /// context already owns it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Whether the current context owns the CPU Lock.
    fn is_cpu_lock_active() -> bool;

    /// Whether the current context is a task context.
    fn is_task_context() -> bool;

    /// Prepare the task's execution state so that the first context restore
    /// transfers control to its entry function with interrupts enabled.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. The task must not be currently running.
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Request the scheduler to run (`control_to_system` in the original
    /// contract). From task context this performs a context switch; from
    /// interrupt context the switch is deferred to the next tick return or
    /// explicit yield.
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive.
    unsafe fn yield_cpu();

    /// One-shot bootstrap: elect the first task via
    /// [`PortToKernel::choose_running_task`], load its context, and never
    /// return.
    ///
    /// # Safety
    ///
    /// Only meant to be called once, by [`System::kernel_run`], with CPU
    /// Lock inactive.
    unsafe fn dispatch_first_task() -> !;

    /// Discard the current context and dispatch the next task.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. `task` must be the task whose context is
    /// being discarded.
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !;

    /// Free-running hardware counter used for microsecond busy-waits. Not
    /// used for scheduling.
    fn hardware_tick() -> u64;
}

/// Kernel storage provided by the application/port glue (typically through a
/// port's `use_port!` macro).
///
/// # Safety
///
/// The implementation must return the same storage on every call, and that
/// storage must not be aliased by anything else.
pub unsafe trait KernelTraits: Port {
    fn state() -> &'static State<Self>;

    /// The task control block arena. [`TaskId`]s are one-based indices into
    /// this pool.
    fn task_cb_pool() -> &'static [TaskCb<Self>];

    /// The idle work registry (may be empty).
    fn idle_work_pool() -> &'static [IdleWorkSlot<Self>];

    /// Stack storage for the idle task.
    fn idle_task_stack() -> TaskStack;

    #[inline]
    fn get_task_cb(index: usize) -> Option<&'static TaskCb<Self>> {
        Self::task_cb_pool().get(index)
    }
}

/// Kernel services called by the port.
pub trait PortToKernel {
    /// Elect the next running task, first draining due sleepers. After this
    /// call returns, `running_task_id` reflects the decision and the
    /// previous task's state has been updated (`TO_BE_SUSPENDED` commits to
    /// `SUSPENDED` here).
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn choose_running_task();

    /// System tick interrupt entry: advances the tick counter, drains due
    /// sleepers, and requests preemption if the ready queue head now
    /// outranks the running task (deferring with `SCHED_DRIFT` when the
    /// running task holds the scheduler lock).
    ///
    /// # Safety
    ///
    /// Must be called from interrupt context with CPU Lock inactive,
    /// exactly once per hardware timer interrupt.
    unsafe fn timer_tick();

    /// The currently elected task.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn running_task_id() -> Option<TaskId>;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn choose_running_task() {
        // Safety: CPU Lock active per this method's precondition
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        task::choose_next_running_task(lock.borrow_mut());
        // The caller remains the owner of the CPU Lock
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        let mut lock =
            klock::lock_cpu::<Traits>().expect("timer tick delivered with CPU Lock active");

        #[cfg(feature = "sleep")]
        if sleep::process_system_tick(lock.borrow_mut()) {
            sleep::process_due_sleepers(lock.borrow_mut());
        }

        task::unlock_cpu_and_check_preemption(lock);
    }

    unsafe fn running_task_id() -> Option<TaskId> {
        // Safety: CPU Lock active per this method's precondition
        let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let id = Traits::state().running_task.get(&*lock);
        core::mem::forget(lock);
        id
    }
}

/// The kernel-global state.
pub struct State<Traits> {
    /// The currently running (elected) task. `None` before the first
    /// dispatch and after the running task finishes.
    pub(crate) running_task: klock::CpuLockCell<Traits, Option<TaskId>>,

    /// Tasks in `RESUME`/`SLEEP_RESUME` state, sorted by priority, FIFO
    /// within a priority. Never empty after `kernel_run` (the idle task is
    /// permanently scheduled).
    pub(crate) ready_queue: klock::CpuLockCell<Traits, ListHead<TaskId>>,

    /// Tasks sorted ascending by wake tick, ties broken by priority.
    #[cfg(feature = "sleep")]
    pub(crate) sleep_queue: klock::CpuLockCell<Traits, ListHead<TaskId>>,

    /// The monotonic system tick counter.
    #[cfg(feature = "sleep")]
    pub(crate) tick_count: klock::CpuLockCell<Traits, Tick>,

    /// Every live task, in creation order.
    #[cfg(feature = "task_stats")]
    pub(crate) task_list: klock::CpuLockCell<Traits, ListHead<TaskId>>,

    pub(crate) idle_task: klock::CpuLockCell<Traits, Option<TaskId>>,

    pub(crate) kernel_running: core::sync::atomic::AtomicBool,

    /// Interlock for runtime idle work updates.
    #[cfg(feature = "idle_runtime_update")]
    pub(crate) idle_work_lock: core::sync::atomic::AtomicBool,
}

impl<Traits> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_task: Init::INIT,
        ready_queue: Init::INIT,
        #[cfg(feature = "sleep")]
        sleep_queue: Init::INIT,
        #[cfg(feature = "sleep")]
        tick_count: Init::INIT,
        #[cfg(feature = "task_stats")]
        task_list: Init::INIT,
        idle_task: Init::INIT,
        kernel_running: Init::INIT,
        #[cfg(feature = "idle_runtime_update")]
        idle_work_lock: Init::INIT,
    };
}

impl<Traits: KernelTraits> State<Traits> {
    /// Whether `kernel_run` has been entered.
    pub fn is_running(&self) -> bool {
        self.kernel_running
            .load(core::sync::atomic::Ordering::Acquire)
    }
}

/// The facade through which the public kernel services are invoked:
/// `System::<Traits>::task_create(..)`, `System::<Traits>::sleep_ticks(..)`
/// and so on. The associated functions live in the modules implementing
/// them.
pub struct System<Traits>(PhantomData<Traits>);
