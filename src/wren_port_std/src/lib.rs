//! Hosted simulation port for the Wren kernel.
//!
//! Each task is backed by an OS thread, gated so that exactly one task
//! thread executes at a time (a single simulated CPU). The CPU Lock is an
//! owner-tracked flag: the owner re-entering fails (`try_enter_cpu_lock`
//! returns `false`, surfacing the kernel's `BadContext` discipline), while
//! any other thread trying to enter spins until the lock is free - which is
//! how masked interrupts present themselves to an interrupt handler.
//!
//! A timer thread delivers [`PortToKernel::timer_tick`] once per system
//! tick. A context switch requested from interrupt context cannot stop the
//! running task thread mid-instruction; instead it is recorded and honoured
//! at the task's next CPU Lock release, matching the kernel's deferred
//! preemption rule for interrupt-driven wakes.
//!
//! [`use_port!`] instantiates one kernel: the traits type, the kernel state,
//! the control-block and idle-work pools, and the port state. Multiple
//! kernels can coexist in one process (one per invocation), which is what
//! the integration tests do.
#![deny(unsafe_op_in_unsafe_fn)]

use std::{
    cell::{Cell, RefCell},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;

use wren_kernel::{task_cb_by_id, utils::Init, KernelTraits, Port, PortToKernel, System, TaskCb};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate wren_kernel;

/// Implemented on a kernel traits type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance: KernelTraits + Port<PortTaskState = TaskState> {
    fn port_state() -> &'static State;
}

/// The internal state of one port instance.
pub struct State {
    sched: SpinMutex<Sched>,
    /// A context switch requested from interrupt context, waiting for the
    /// running task to reach a preemption point.
    dispatch_pending: AtomicBool,
    /// No task thread is executing (the scheduler found nothing runnable);
    /// the timer thread performs the next dispatch itself.
    cpu_halted: AtomicBool,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    timer_stop: AtomicBool,
    origin: OnceCell<Instant>,
}

struct Sched {
    cpu_lock: bool,
    cpu_lock_owner: Option<thread::ThreadId>,
}

#[allow(clippy::new_without_default)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: SpinMutex::new(Sched {
                cpu_lock: false,
                cpu_lock_owner: None,
            }),
            dispatch_pending: AtomicBool::new(false),
            cpu_halted: AtomicBool::new(false),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            timer_stop: AtomicBool::new(false),
            origin: OnceCell::new(),
        }
    }
}

/// Port-side per-task state: the gate the backing thread parks on.
pub struct TaskState {
    gate: SpinMutex<Option<Arc<Gate>>>,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            gate: SpinMutex::new(None),
        }
    }
}

impl Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskState")
    }
}

/// A binary handoff: `open` grants one run permit, `wait` consumes it.
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
        *open = false;
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that builds the application and boots the kernel.
    Boot,
    /// The backing thread for an interrupt context (the timer).
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
    /// The gate of the task this thread is backing, if any.
    static THREAD_GATE: RefCell<Option<Arc<Gate>>> = RefCell::new(None);
}

/// The `Port` implementation functions, delegated to by [`use_port!`].
#[doc(hidden)]
pub mod imp {
    use super::*;

    pub fn try_enter_cpu_lock<Traits: PortInstance>() -> bool {
        let state = Traits::port_state();
        let me = thread::current().id();
        loop {
            let mut sched = state.sched.lock();
            if !sched.cpu_lock {
                sched.cpu_lock = true;
                sched.cpu_lock_owner = Some(me);
                return true;
            }
            if sched.cpu_lock_owner == Some(me) {
                // Re-entry by the owner; the kernel maps this to BadContext
                return false;
            }
            // Another context owns the lock; to us, interrupts are masked
            drop(sched);
            thread::yield_now();
        }
    }

    pub fn enter_cpu_lock<Traits: PortInstance>() {
        let state = Traits::port_state();
        let me = thread::current().id();
        loop {
            let mut sched = state.sched.lock();
            if !sched.cpu_lock {
                sched.cpu_lock = true;
                sched.cpu_lock_owner = Some(me);
                return;
            }
            assert_ne!(
                sched.cpu_lock_owner,
                Some(me),
                "CPU Lock re-entered by its owner"
            );
            drop(sched);
            thread::yield_now();
        }
    }

    fn leave_cpu_lock_raw<Traits: PortInstance>() {
        let mut sched = Traits::port_state().sched.lock();
        debug_assert_eq!(sched.cpu_lock_owner, Some(thread::current().id()));
        sched.cpu_lock = false;
        sched.cpu_lock_owner = None;
    }

    pub fn leave_cpu_lock<Traits: PortInstance>() {
        leave_cpu_lock_raw::<Traits>();

        // A CPU Lock release in task context is a preemption point: honour a
        // switch that an interrupt requested while we were running
        if THREAD_ROLE.with(|r| r.get()) == ThreadRole::Task
            && Traits::port_state().dispatch_pending.load(Ordering::Acquire)
        {
            dispatch::<Traits>();
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>() -> bool {
        let sched = Traits::port_state().sched.lock();
        sched.cpu_lock && sched.cpu_lock_owner == Some(thread::current().id())
    }

    pub fn is_task_context<Traits: PortInstance>() -> bool {
        THREAD_ROLE.with(|r| r.get()) == ThreadRole::Task
    }

    /// Run the scheduler and hand control to its decision. Called with the
    /// CPU Lock inactive.
    pub(crate) fn dispatch<Traits: PortInstance>() {
        let state = Traits::port_state();
        state.dispatch_pending.store(false, Ordering::SeqCst);

        enter_cpu_lock::<Traits>();
        // Safety: CPU Lock active
        unsafe { Traits::choose_running_task() };
        // Safety: CPU Lock active
        let next = unsafe { Traits::running_task_id() };
        leave_cpu_lock_raw::<Traits>();

        let next_gate = next.map(|id| gate_of::<Traits>(id));
        let my_gate = THREAD_GATE.with(|g| g.borrow().clone());

        match (next_gate, my_gate) {
            (Some(next), Some(mine)) => {
                if Arc::ptr_eq(&next, &mine) {
                    // Elected again; keep running
                    return;
                }
                log::trace!("dispatch: switching");
                state.cpu_halted.store(false, Ordering::SeqCst);
                next.open();
                mine.wait();
            }
            (Some(next), None) => {
                // Boot or timer context handing off; it never runs a task
                // itself
                state.cpu_halted.store(false, Ordering::SeqCst);
                next.open();
            }
            (None, Some(mine)) => {
                // Nothing runnable; halt the simulated processor until a
                // wake makes this task (or another) ready
                state.cpu_halted.store(true, Ordering::SeqCst);
                mine.wait();
            }
            (None, None) => {
                state.cpu_halted.store(true, Ordering::SeqCst);
            }
        }
    }

    fn gate_of<Traits: PortInstance>(id: wren_kernel::TaskId) -> Arc<Gate> {
        task_cb_by_id::<Traits>(id)
            .port_task_state
            .gate
            .lock()
            .clone()
            .expect("task has no backing thread")
    }

    pub fn yield_cpu<Traits: PortInstance>() {
        match THREAD_ROLE.with(|r| r.get()) {
            ThreadRole::Interrupt => {
                // Deferred: the switch happens at the running task's next
                // preemption point
                Traits::port_state()
                    .dispatch_pending
                    .store(true, Ordering::SeqCst);
            }
            _ => dispatch::<Traits>(),
        }
    }

    pub fn initialize_task_state<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
        let gate = Arc::new(Gate::new());
        *task.port_task_state.gate.lock() = Some(gate.clone());

        let name = task.attr().name;
        thread::Builder::new()
            .name(format!("task {name}"))
            .spawn(move || task_thread_main::<Traits>(task, gate))
            .unwrap();
    }

    fn task_thread_main<Traits: PortInstance>(task: &'static TaskCb<Traits>, gate: Arc<Gate>) {
        THREAD_ROLE.with(|r| r.set(ThreadRole::Task));
        THREAD_GATE.with(|g| *g.borrow_mut() = Some(gate.clone()));

        gate.wait();
        log::trace!("task {:?} entered", task.attr().name);

        let attr = task.attr();
        if let Some(entry) = attr.entry {
            entry(attr.arg);
        }

        // Requeues or finishes the task and dispatches the next one
        System::<Traits>::task_finished(task);
    }

    pub fn dispatch_first_task<Traits: PortInstance>() -> ! {
        log::trace!("dispatch_first_task");
        dispatch::<Traits>();
        // The boot context has handed control to the first task and is done
        loop {
            thread::park();
        }
    }

    pub fn exit_and_dispatch<Traits: PortInstance>(task: &'static TaskCb<Traits>) -> ! {
        log::trace!("exit_and_dispatch({:?})", task.attr().name);
        // Entered with CPU Lock active
        leave_cpu_lock_raw::<Traits>();

        // Dissociate this thread so the dispatcher never hands control back
        // to the abandoned context. A re-activated task gets a fresh thread
        // from `initialize_task_state`.
        THREAD_GATE.with(|g| *g.borrow_mut() = None);
        dispatch::<Traits>();

        loop {
            thread::park();
        }
    }

    pub fn hardware_tick<Traits: PortInstance>() -> u64 {
        let origin = Traits::port_state().origin.get_or_init(Instant::now);
        origin.elapsed().as_micros() as u64
    }
}

/// Boot one kernel instance: run `setup` (task creation etc.) in a fresh
/// boot context, start the kernel, and deliver timer ticks until
/// [`shutdown`] is called. Returns once the simulation has shut down.
pub fn port_boot<Traits: PortInstance>(setup: impl FnOnce() + Send + 'static) {
    let _ = env_logger::builder().is_test(true).try_init();

    let state = Traits::port_state();
    let _ = state.origin.get_or_init(Instant::now);

    log::trace!("starting the timer thread");
    thread::Builder::new()
        .name("timer".into())
        .spawn(move || {
            THREAD_ROLE.with(|r| r.set(ThreadRole::Interrupt));
            let period = Duration::from_micros(1_000_000 / Traits::TICKS_PER_SEC as u64);
            while !Traits::port_state().timer_stop.load(Ordering::Acquire) {
                thread::sleep(period);
                // Safety: interrupt context; this thread never holds the
                // CPU Lock across iterations
                unsafe { Traits::timer_tick() };

                // With the processor halted there is no task thread to pick
                // up a deferred switch, so deliver it from here
                let state = Traits::port_state();
                if state.dispatch_pending.load(Ordering::SeqCst)
                    && state.cpu_halted.load(Ordering::SeqCst)
                {
                    imp::dispatch::<Traits>();
                }
            }
        })
        .unwrap();

    thread::Builder::new()
        .name("boot".into())
        .spawn(move || {
            THREAD_ROLE.with(|r| r.set(ThreadRole::Boot));
            setup();
            System::<Traits>::kernel_run();
        })
        .unwrap();

    let mut done = state.shutdown.lock().unwrap();
    while !*done {
        done = state.shutdown_cv.wait(done).unwrap();
    }
    state.timer_stop.store(true, Ordering::Release);
}

/// End the simulation. The calling context never runs again; `port_boot`
/// returns in the harness.
pub fn shutdown<Traits: PortInstance>() -> ! {
    log::trace!("shutdown");
    let state = Traits::port_state();
    *state.shutdown.lock().unwrap() = true;
    state.shutdown_cv.notify_all();
    loop {
        thread::park();
    }
}

/// Instantiate one kernel: the traits type, its storage pools, and the port
/// glue binding the two.
///
/// ```ignore
/// wren_port_std::use_port!(struct SystemTraits {
///     task_slots: 8,
///     idle_work_slots: 4,
///     idle_task_stack_size: 4096,
/// });
/// ```
#[macro_export]
macro_rules! use_port {
    (struct $Traits:ident {
        task_slots: $task_slots:expr,
        idle_work_slots: $idle_work_slots:expr,
        idle_task_stack_size: $idle_task_stack_size:expr
        $(, max_priority: $max_pri:expr)?
        $(, max_lock: $max_lock:expr)?
        $(, ticks_per_sec: $ticks_per_sec:expr)?
        $(,)?
    }) => {
        pub struct $Traits;

        static PORT_STATE: $crate::State = $crate::State::new();

        static KERNEL_STATE: $crate::wren_kernel::State<$Traits> =
            <$crate::wren_kernel::State<$Traits> as $crate::wren_kernel::utils::Init>::INIT;

        static TASK_CB_POOL: [$crate::wren_kernel::TaskCb<$Traits>; $task_slots] = {
            const SLOT: $crate::wren_kernel::TaskCb<$Traits> =
                <$crate::wren_kernel::TaskCb<$Traits> as $crate::wren_kernel::utils::Init>::INIT;
            [SLOT; $task_slots]
        };

        static IDLE_WORK_POOL: [$crate::wren_kernel::IdleWorkSlot<$Traits>; $idle_work_slots] = {
            const SLOT: $crate::wren_kernel::IdleWorkSlot<$Traits> =
                <$crate::wren_kernel::IdleWorkSlot<$Traits> as $crate::wren_kernel::utils::Init>::INIT;
            [SLOT; $idle_work_slots]
        };

        static IDLE_TASK_STACK: $crate::wren_kernel::StackStorage<{ $idle_task_stack_size }> =
            $crate::wren_kernel::StackStorage::new();

        unsafe impl $crate::wren_kernel::Port for $Traits {
            type PortTaskState = $crate::TaskState;

            unsafe fn enter_cpu_lock() {
                $crate::imp::enter_cpu_lock::<Self>()
            }
            unsafe fn leave_cpu_lock() {
                $crate::imp::leave_cpu_lock::<Self>()
            }
            unsafe fn try_enter_cpu_lock() -> bool {
                $crate::imp::try_enter_cpu_lock::<Self>()
            }
            fn is_cpu_lock_active() -> bool {
                $crate::imp::is_cpu_lock_active::<Self>()
            }
            fn is_task_context() -> bool {
                $crate::imp::is_task_context::<Self>()
            }
            unsafe fn initialize_task_state(task: &'static $crate::wren_kernel::TaskCb<Self>) {
                $crate::imp::initialize_task_state::<Self>(task)
            }
            unsafe fn yield_cpu() {
                $crate::imp::yield_cpu::<Self>()
            }
            unsafe fn dispatch_first_task() -> ! {
                $crate::imp::dispatch_first_task::<Self>()
            }
            unsafe fn exit_and_dispatch(task: &'static $crate::wren_kernel::TaskCb<Self>) -> ! {
                $crate::imp::exit_and_dispatch::<Self>(task)
            }
            fn hardware_tick() -> u64 {
                $crate::imp::hardware_tick::<Self>()
            }
        }

        impl $crate::wren_kernel::KernelCfg for $Traits {
            $( const SCHEDULER_MAX_PRI: $crate::wren_kernel::Priority = $max_pri; )?
            $( const SCHEDULER_MAX_LOCK: u8 = $max_lock; )?
            $( const TICKS_PER_SEC: u32 = $ticks_per_sec; )?
        }

        unsafe impl $crate::wren_kernel::KernelTraits for $Traits {
            fn state() -> &'static $crate::wren_kernel::State<Self> {
                &KERNEL_STATE
            }
            fn task_cb_pool() -> &'static [$crate::wren_kernel::TaskCb<Self>] {
                &TASK_CB_POOL
            }
            fn idle_work_pool() -> &'static [$crate::wren_kernel::IdleWorkSlot<Self>] {
                &IDLE_WORK_POOL
            }
            fn idle_task_stack() -> $crate::wren_kernel::TaskStack {
                $crate::wren_kernel::TaskStack::from_storage(&IDLE_TASK_STACK)
            }
        }

        unsafe impl $crate::PortInstance for $Traits {
            fn port_state() -> &'static $crate::State {
                &PORT_STATE
            }
        }
    };
}
