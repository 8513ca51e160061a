//! Tasks and the scheduler
use core::{fmt, mem, sync::atomic::Ordering};

use crate::{
    error::{BadContextError, CreateTaskError},
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, task_cb_by_id,
    utils::{Init, RawCell},
    KernelTraits, Port, Priority, System, TaskId,
};

#[doc(hidden)]
pub mod readyqueue;

#[cfg(feature = "sleep")]
use crate::Tick;

/// Alignment required of task stack storage.
pub const STACK_ALIGN: usize = 16;

/// The byte pattern task stacks are filled with at creation. The stack
/// high-water diagnostic scans for it.
pub const STACK_FILL_BYTE: u8 = 0x55;

/// A caller-provided stack region. The kernel never owns the memory; it only
/// records where it is so the port's `initialize_task_state` and the stack
/// diagnostics can find it.
#[derive(Clone, Copy)]
pub struct TaskStack {
    ptr: *mut u8,
    len: usize,
}

// Safety: The pointee is only touched by the port while the owning task is
// being initialized or running, never from two contexts at once.
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl Init for TaskStack {
    const INIT: Self = Self {
        ptr: core::ptr::null_mut(),
        len: 0,
    };
}

impl TaskStack {
    pub fn from_storage<const LEN: usize>(storage: &'static StackStorage<LEN>) -> Self {
        Self {
            ptr: storage.bytes.get() as *mut u8,
            len: LEN,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for TaskStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStack")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Statically allocatable stack storage with the required alignment.
#[repr(C)]
pub struct StackStorage<const LEN: usize> {
    _align: elain::Align<STACK_ALIGN>,
    bytes: RawCell<[u8; LEN]>,
}

impl<const LEN: usize> StackStorage<LEN> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            _align: elain::Align::NEW,
            bytes: RawCell::new([0; LEN]),
        }
    }
}

bitflags::bitflags! {
    /// The per-task flags word.
    pub struct TaskFlags: u8 {
        /// When the task's entry function returns, re-initialize the task
        /// and hand it back to the scheduler instead of transitioning it to
        /// `FINISHED`.
        const RETURN_TO_SCHEDULER = 1 << 0;

        /// A preemption was suppressed by the scheduler lock. Cleared by
        /// `scheduler_unlock`, which performs the deferred yield.
        const SCHED_DRIFT = 1 << 1;
    }
}

impl Init for TaskFlags {
    const INIT: Self = Self::empty();
}

#[doc = svgbobdoc::transform!(
/// Task state machine
///
/// ```svgbob
///           task_create          scheduler_task_add
///   FREE ─────────────▶ CREATED ───────────────────▶ RESUME ◀─────┐
///                                                      │          │
///                                              elected │          │ yield /
///                                                      ▼          │ wake
///                                                   RUNNING ──────┤
///                                                      │          │
///                                        block / sleep │          │
///                                                      ▼          │
///                                             TO_BE_SUSPENDED     │
///                                                      │          │
///                                      context switch  │          │
///                                                      ▼          │
///                                                  SUSPENDED ─────┘
///                                            (SLEEP_RESUME when woken
///                                             by the tick drain)
/// ```
///
/// `FINISHED` is entered when a task without `RETURN_TO_SCHEDULER` returns
/// from its entry function.
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The control block slot is unused.
    Free,
    /// Created but not yet handed to the scheduler.
    Created,
    /// In the ready queue.
    Resume,
    /// In the ready queue, woken by the tick drain.
    SleepResume,
    Running,
    /// Blocking in progress; becomes `Suspended` once the context switch
    /// completes.
    ToBeSuspended,
    Suspended,
    Finished,
}

impl Init for TaskSt {
    const INIT: Self = Self::Free;
}

/// The static-ish properties of a task, written once during `task_create`.
#[derive(Debug)]
pub struct TaskAttr {
    pub name: &'static str,
    pub entry: Option<fn(usize)>,
    pub arg: usize,
    pub stack: TaskStack,
}

impl Init for TaskAttr {
    const INIT: Self = Self {
        name: "",
        entry: None,
        arg: 0,
        stack: Init::INIT,
    };
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: Port> {
    /// Port-specific state, placed at the beginning of the struct so
    /// context-switch code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    /// Written while the slot transitions `Free → Created` with the CPU
    /// Lock held, immutable while the task is live. [`Self::attr`] relies on
    /// this write-once discipline.
    attr: RawCell<TaskAttr>,

    pub(crate) priority: CpuLockCell<Traits, Priority>,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    /// Scheduler lock (preemption disable) nesting depth. Mutated only on
    /// behalf of the owning task.
    pub(crate) lock_count: CpuLockCell<Traits, u8>,

    pub(crate) flags: CpuLockCell<Traits, TaskFlags>,

    /// The tick at which the task should wake. Valid only while the task is
    /// on the sleep queue.
    #[cfg(feature = "sleep")]
    pub(crate) tick_sleep: CpuLockCell<Traits, Tick>,

    /// Link for the ready queue.
    pub(crate) link_ready: CpuLockCell<Traits, Option<TaskId>>,

    /// Link for the sleep queue.
    #[cfg(feature = "sleep")]
    pub(crate) link_sleep: CpuLockCell<Traits, Option<TaskId>>,

    /// Link for the global task list.
    #[cfg(feature = "task_stats")]
    pub(crate) link_global: CpuLockCell<Traits, Option<TaskId>>,

    /// How many times the scheduler elected this task.
    #[cfg(feature = "task_stats")]
    pub(crate) scheduled: CpuLockCell<Traits, u32>,
}

impl<Traits: Port> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        attr: Init::INIT,
        priority: Init::INIT,
        st: Init::INIT,
        lock_count: Init::INIT,
        flags: Init::INIT,
        #[cfg(feature = "sleep")]
        tick_sleep: Init::INIT,
        link_ready: Init::INIT,
        #[cfg(feature = "sleep")]
        link_sleep: Init::INIT,
        #[cfg(feature = "task_stats")]
        link_global: Init::INIT,
        #[cfg(feature = "task_stats")]
        scheduled: Init::INIT,
    };
}

impl<Traits: Port> TaskCb<Traits> {
    /// The task's creation attributes.
    ///
    /// Reading races with nothing: the pointee is written only during the
    /// `Free → Created` transition, before the task becomes reachable by
    /// the scheduler or the port.
    pub fn attr(&self) -> &TaskAttr {
        unsafe { &*self.attr.get() }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.attr().name)
            .field("port_task_state", &self.port_task_state)
            .field("priority", &self.priority)
            .field("st", &self.st)
            .field("lock_count", &self.lock_count)
            .field("flags", &self.flags.debug_fmt_with(|x, f| x.bits().fmt(f)))
            .finish()
    }
}

/// Find the [`TaskId`] of a control block by its position in the pool.
pub fn task_id_of_cb<Traits: KernelTraits>(task_cb: &TaskCb<Traits>) -> TaskId {
    let offset_bytes =
        task_cb as *const TaskCb<_> as usize - Traits::task_cb_pool().as_ptr() as usize;
    TaskId::from_index(offset_bytes / mem::size_of::<TaskCb<Traits>>())
}

/// The reason a task is handed back to the ready queue.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum YieldReason {
    /// Preempted or voluntarily yielded.
    System,
    /// Woken by the sleep-queue drain.
    #[cfg(feature = "sleep")]
    Sleep,
}

impl<Traits: KernelTraits> System<Traits> {
    /// Initialize a control block slot for a new task. The task does not run
    /// until [`Self::scheduler_task_add`] hands it to the scheduler.
    pub fn task_create(
        name: &'static str,
        stack: TaskStack,
        entry: fn(usize),
        arg: usize,
        flags: TaskFlags,
    ) -> Result<TaskId, CreateTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let pool = Traits::task_cb_pool();
        let index = (0..pool.len())
            .find(|&i| pool[i].st.get(&*lock) == TaskSt::Free)
            .ok_or(CreateTaskError::NoTaskSlot)?;
        let task_cb = &pool[index];
        let id = TaskId::from_index(index);

        // Safety: the slot is `Free`, so nothing else references the attr,
        // and we hold the CPU Lock
        unsafe {
            *task_cb.attr.get() = TaskAttr {
                name,
                entry: Some(entry),
                arg,
                stack,
            };
        }

        if !stack.is_empty() {
            // Fill the stack with the sentinel pattern for the high-water
            // diagnostic
            unsafe { core::ptr::write_bytes(stack.as_ptr(), STACK_FILL_BYTE, stack.len()) };
        }

        task_cb.priority.replace(&mut *lock, 0);
        task_cb.lock_count.replace(&mut *lock, 0);
        task_cb
            .flags
            .replace(&mut *lock, flags & TaskFlags::RETURN_TO_SCHEDULER);
        task_cb.st.replace(&mut *lock, TaskSt::Created);
        #[cfg(feature = "task_stats")]
        task_cb.scheduled.replace(&mut *lock, 0);

        // Safety: CPU Lock active, the slot was `Free`
        unsafe { Traits::initialize_task_state(task_cb) };

        #[cfg(feature = "task_stats")]
        {
            let state = Traits::state();
            let mut head = state.task_list.get(&*lock);
            let mut links = GlobalLinks::<Traits> {
                token: lock.borrow_mut(),
            };
            crate::utils::list::push_back(&mut head, &mut links, id);
            state.task_list.replace(&mut *lock, head);
        }

        Ok(id)
    }

    /// Hand a created task to the scheduler at the given priority.
    ///
    /// An invalid priority or a task that is neither freshly created nor
    /// finished is a programmer error and halts the kernel.
    pub fn scheduler_task_add(task: TaskId, priority: Priority) {
        let mut lock =
            klock::lock_cpu::<Traits>().expect("scheduler_task_add with CPU Lock active");
        let task_cb = task_cb_by_id::<Traits>(task);

        if Traits::state().idle_task.get(&*lock) != Some(task) {
            assert!(
                priority <= Traits::SCHEDULER_MAX_PRI,
                "invalid task priority"
            );
        }
        let st = task_cb.st.get(&*lock);
        assert!(
            matches!(st, TaskSt::Created | TaskSt::Finished),
            "task is already scheduled"
        );
        if st == TaskSt::Finished {
            // Rerunning a finished task starts over from its entry function
            // Safety: CPU Lock active, the task is not running
            unsafe { Traits::initialize_task_state(task_cb) };
        }

        task_cb.priority.replace(&mut *lock, priority);
        yield_task(lock.borrow_mut(), task, YieldReason::System);

        if Traits::state().is_running() {
            // The new task may outrank the running one
            unlock_cpu_and_check_preemption::<Traits>(lock);
        }
    }

    /// Retire a finished task, freeing its control block slot.
    pub fn scheduler_task_remove(task: TaskId) {
        let mut lock =
            klock::lock_cpu::<Traits>().expect("scheduler_task_remove with CPU Lock active");
        let task_cb = task_cb_by_id::<Traits>(task);

        assert_eq!(
            task_cb.st.get(&*lock),
            TaskSt::Finished,
            "task has not finished"
        );

        #[cfg(feature = "task_stats")]
        {
            let state = Traits::state();
            let mut head = state.task_list.get(&*lock);
            let mut links = GlobalLinks::<Traits> {
                token: lock.borrow_mut(),
            };
            crate::utils::list::remove(&mut head, &mut links, task);
            state.task_list.replace(&mut *lock, head);
        }

        task_cb.flags.replace(&mut *lock, TaskFlags::empty());
        task_cb.st.replace(&mut *lock, TaskSt::Free);
    }

    /// Requeue the current task behind every other ready task of its
    /// priority and let the scheduler run.
    pub fn task_yield() {
        let mut lock = klock::lock_cpu::<Traits>().expect("task_yield with CPU Lock active");
        let Some(cur) = Traits::state().running_task.get(&*lock) else {
            return;
        };
        debug_assert_eq!(task_cb_by_id::<Traits>(cur).st.get(&*lock), TaskSt::Running);
        yield_task(lock.borrow_mut(), cur, YieldReason::System);
        drop(lock);
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }

    /// Disable preemption of the current task. Nests.
    pub fn scheduler_lock() {
        let mut lock = klock::lock_cpu::<Traits>().expect("scheduler_lock with CPU Lock active");
        if let Some(cur) = Traits::state().running_task.get(&*lock) {
            let task_cb = task_cb_by_id::<Traits>(cur);
            let count = task_cb.lock_count.get(&*lock);
            assert!(
                count < Traits::SCHEDULER_MAX_LOCK,
                "scheduler lock nested too deep"
            );
            task_cb.lock_count.replace(&mut *lock, count + 1);
        }
    }

    /// Re-enable preemption. When the nesting count returns to zero and a
    /// preemption was missed while locked (`SCHED_DRIFT`), the current task
    /// yields before this function returns.
    pub fn scheduler_unlock() {
        let mut lock = klock::lock_cpu::<Traits>().expect("scheduler_unlock with CPU Lock active");
        let Some(cur) = Traits::state().running_task.get(&*lock) else {
            return;
        };
        let task_cb = task_cb_by_id::<Traits>(cur);
        let count = task_cb.lock_count.get(&*lock);
        assert!(count > 0, "scheduler lock is not held");
        task_cb.lock_count.replace(&mut *lock, count - 1);

        let flags = task_cb.flags.get(&*lock);
        if count == 1 && flags.contains(TaskFlags::SCHED_DRIFT) {
            task_cb
                .flags
                .replace(&mut *lock, flags & !TaskFlags::SCHED_DRIFT);
            drop(lock);
            Self::task_yield();
        }
    }

    /// The id of the currently running task.
    pub fn current_task() -> Result<TaskId, BadContextError> {
        state::expect_task_context::<Traits>()?;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().running_task.get(&*lock).unwrap())
    }

    /// Start the kernel: create the idle task and dispatch the first task.
    /// At least one user task must have been added. Never returns.
    pub fn kernel_run() -> ! {
        let state = Traits::state();
        assert!(!state.is_running(), "kernel is already running");
        {
            let lock = klock::lock_cpu::<Traits>().expect("kernel_run with CPU Lock active");
            assert!(
                !state.ready_queue.get(&*lock).is_empty(),
                "no task has been added"
            );
        }

        crate::idle::idle_task_init::<Traits>();
        state.kernel_running.store(true, Ordering::Release);

        // Safety: one-shot bootstrap, CPU Lock inactive
        unsafe { Traits::dispatch_first_task() }
    }

    /// Called by the port when a task's entry function returns. Requeues the
    /// task if it was created with `RETURN_TO_SCHEDULER`; otherwise the task
    /// transitions to `FINISHED`.
    pub fn task_finished(task_cb: &'static TaskCb<Traits>) -> ! {
        let mut lock = klock::lock_cpu::<Traits>().expect("task_finished with CPU Lock active");
        let id = task_id_of_cb::<Traits>(task_cb);
        debug_assert_eq!(Traits::state().running_task.get(&*lock), Some(id));

        if task_cb
            .flags
            .get(&*lock)
            .contains(TaskFlags::RETURN_TO_SCHEDULER)
        {
            // Safety: CPU Lock active; the task's old context is being
            // abandoned by `exit_and_dispatch` below
            unsafe { Traits::initialize_task_state(task_cb) };
            yield_task(lock.borrow_mut(), id, YieldReason::System);
        } else {
            task_cb.st.replace(&mut *lock, TaskSt::Finished);
        }

        mem::forget(lock);
        // Safety: CPU Lock active, `task_cb` is the task being exited
        unsafe { Traits::exit_and_dispatch(task_cb) }
    }

    /// Bytes of the task's stack never touched since creation, measured by
    /// scanning for the fill pattern.
    #[cfg(feature = "task_stats")]
    pub fn task_stack_free(task: TaskId) -> usize {
        let task_cb = task_cb_by_id::<Traits>(task);
        let stack = task_cb.attr().stack;
        let mut free = 0;
        while free < stack.len() {
            // Safety: in-bounds read of the caller-provided stack region
            if unsafe { stack.as_ptr().add(free).read_volatile() } != STACK_FILL_BYTE {
                break;
            }
            free += 1;
        }
        free
    }

    /// How many times the scheduler elected the task.
    #[cfg(feature = "task_stats")]
    pub fn task_scheduled_count(task: TaskId) -> u32 {
        let lock = klock::lock_cpu::<Traits>().expect("task_scheduled_count with CPU Lock active");
        task_cb_by_id::<Traits>(task).scheduled.get(&*lock)
    }
}

/// Link adapter for the global task list.
#[cfg(feature = "task_stats")]
struct GlobalLinks<'a, Traits: KernelTraits> {
    token: CpuLockTokenRefMut<'a, Traits>,
}

#[cfg(feature = "task_stats")]
impl<Traits: KernelTraits> crate::utils::list::LinkAdapter<TaskId> for GlobalLinks<'_, Traits> {
    fn next(&self, node: TaskId) -> Option<TaskId> {
        task_cb_by_id::<Traits>(node).link_global.get(&*self.token)
    }
    fn set_next(&mut self, node: TaskId, next: Option<TaskId>) {
        task_cb_by_id::<Traits>(node)
            .link_global
            .replace(&mut *self.token, next);
    }
}

/// Hand `task` back to the ready queue.
pub(crate) fn yield_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
    reason: YieldReason,
) {
    let task_cb = task_cb_by_id::<Traits>(task);
    match reason {
        YieldReason::System => {
            task_cb.st.replace(&mut *lock, TaskSt::Resume);
        }
        #[cfg(feature = "sleep")]
        YieldReason::Sleep => {
            task_cb.tick_sleep.replace(&mut *lock, 0);
            task_cb.st.replace(&mut *lock, TaskSt::SleepResume);
        }
    }
    readyqueue::push(lock, task);
}

/// Elect the next running task. Called from the port's context-switch path
/// with CPU Lock active.
pub(super) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Sleepers that became due wake before the scheduling decision
    #[cfg(feature = "sleep")]
    crate::sleep::process_due_sleepers(lock.borrow_mut());

    let state = Traits::state();
    let prev = state.running_task.get(&*lock);
    let prev_task_priority = match prev {
        Some(id) if task_cb_by_id::<Traits>(id).st.get(&*lock) == TaskSt::Running => {
            task_cb_by_id::<Traits>(id).priority.get(&*lock) as usize
        }
        _ => usize::MAX,
    };

    let head = readyqueue::front(lock.borrow_mut());
    let preempt = match head {
        Some(h) => (task_cb_by_id::<Traits>(h).priority.get(&*lock) as usize) < prev_task_priority,
        None => false,
    };

    if !preempt {
        if prev_task_priority == usize::MAX {
            // The previous task is no longer runnable and nothing is ready.
            // Unreachable once the idle task is scheduled, but the decision
            // must still be committed.
            if let Some(p) = prev {
                let task_cb = task_cb_by_id::<Traits>(p);
                if task_cb.st.get(&*lock) == TaskSt::ToBeSuspended {
                    task_cb.st.replace(&mut *lock, TaskSt::Suspended);
                }
            }
            state.running_task.replace(&mut *lock, None);
        }
        return;
    }

    let next = readyqueue::pop(lock.borrow_mut());
    debug_assert_eq!(next, head);
    let next = next.unwrap();

    let next_cb = task_cb_by_id::<Traits>(next);
    next_cb.st.replace(&mut *lock, TaskSt::Running);
    #[cfg(feature = "task_stats")]
    {
        let n = next_cb.scheduled.get(&*lock);
        next_cb.scheduled.replace(&mut *lock, n.wrapping_add(1));
    }

    if prev == Some(next) {
        // The task yielded and won the election again
        return;
    }

    if let Some(p) = prev {
        let prev_cb = task_cb_by_id::<Traits>(p);
        match prev_cb.st.get(&*lock) {
            // Preempted while still runnable
            TaskSt::Running => yield_task(lock.borrow_mut(), p, YieldReason::System),
            // The context switch completes the suspension
            TaskSt::ToBeSuspended => {
                prev_cb.st.replace(&mut *lock, TaskSt::Suspended);
            }
            // Already requeued, parked, or finished
            _ => {}
        }
    }

    state.running_task.replace(&mut *lock, Some(next));
}

/// Relinquish the CPU Lock. After that, if the ready queue head outranks the
/// running task, request a context switch - unless the running task holds
/// the scheduler lock, in which case the switch is deferred by setting
/// `SCHED_DRIFT`.
///
/// System services that make a task ready call this before returning.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();
    let Some(cur) = state.running_task.get(&*lock) else {
        // The processor was left with nothing runnable; restart dispatching
        // if that has changed
        if state.is_running() && readyqueue::front(lock.borrow_mut()).is_some() {
            drop(lock);
            // Safety: CPU Lock inactive
            unsafe { Traits::yield_cpu() };
        }
        return;
    };
    let task_cb = task_cb_by_id::<Traits>(cur);
    if task_cb.st.get(&*lock) != TaskSt::Running {
        return;
    }
    let cur_pri = task_cb.priority.get(&*lock);

    let preempting = readyqueue::front(lock.borrow_mut())
        .map_or(false, |h| task_cb_by_id::<Traits>(h).priority.get(&*lock) < cur_pri);
    if !preempting {
        return;
    }

    if task_cb.lock_count.get(&*lock) > 0 {
        let flags = task_cb.flags.get(&*lock);
        task_cb
            .flags
            .replace(&mut *lock, flags | TaskFlags::SCHED_DRIFT);
        return;
    }

    drop(lock);
    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };
}

/// Transition the currently running task into `TO_BE_SUSPENDED` and drive
/// the port until a producer (or the tick drain) makes it `Running` again.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let cur = Traits::state().running_task.get(&*lock).unwrap();
    let task_cb = task_cb_by_id::<Traits>(cur);
    assert_eq!(task_cb.st.get(&*lock), TaskSt::Running);
    task_cb.st.replace(&mut *lock, TaskSt::ToBeSuspended);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`.
        // Safety: (1) No CPU-Lock-protected resources are accessed in the
        //         window. (2) We currently own the CPU Lock. (3) It is
        //         re-acquired before this function returns.
        unsafe { Traits::leave_cpu_lock() };
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
        unsafe { Traits::enter_cpu_lock() };

        if task_cb.st.get(&*lock) == TaskSt::Running {
            break;
        }
        debug_assert!(matches!(
            task_cb.st.get(&*lock),
            TaskSt::ToBeSuspended | TaskSt::Suspended
        ));
    }
}
