//! End-to-end scheduling scenarios, one simulated kernel per module.
use std::sync::atomic::{AtomicUsize, Ordering};

/// An atomic counter for checking an execution sequence.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Assert that the counter is equal to `old` and then replace it with
    /// `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        let got = self.counter.load(Ordering::Relaxed);
        log::debug!("{got} (expected: {old}) → {new}");
        assert_eq!(got, old, "expected {old}, got {got}");
        self.counter.store(new, Ordering::Relaxed);
    }
}

/// Tasks A(5) and B(5) alternate only on explicit yield while C(3) owns the
/// processor until it finishes.
mod strict_priority {
    use super::SeqTracker;
    use wren_kernel::{StackStorage, TaskFlags, TaskStack};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_A: StackStorage<4096> = StackStorage::new();
    static STACK_B: StackStorage<4096> = StackStorage::new();
    static STACK_C: StackStorage<4096> = StackStorage::new();

    fn task_c(_: usize) {
        // Highest priority: first to run, and a yield hands control right
        // back because nothing outranks it
        SEQ.expect_and_replace(0, 1);
        System::task_yield();
        SEQ.expect_and_replace(1, 2);
    }

    fn task_a(_: usize) {
        SEQ.expect_and_replace(2, 3);
        System::task_yield();
        SEQ.expect_and_replace(4, 5);
    }

    fn task_b(_: usize) {
        SEQ.expect_and_replace(3, 4);
        System::task_yield();
        SEQ.expect_and_replace(5, 6);
        wren_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn strict_priority() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            let a = System::task_create(
                "a",
                TaskStack::from_storage(&STACK_A),
                task_a,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let b = System::task_create(
                "b",
                TaskStack::from_storage(&STACK_B),
                task_b,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let c = System::task_create(
                "c",
                TaskStack::from_storage(&STACK_C),
                task_c,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(a, 5);
            System::scheduler_task_add(b, 5);
            System::scheduler_task_add(c, 3);
        });
        assert_eq!(SEQ.get(), 6);
    }
}

/// `sleep_ticks(n)` returns no earlier than `t0 + n`.
mod sleep_lower_bound {
    use super::SeqTracker;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wren_kernel::{StackStorage, TaskFlags, TaskStack};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_SLOW: StackStorage<4096> = StackStorage::new();
    static STACK_FAST: StackStorage<4096> = StackStorage::new();
    static T_SLOW: AtomicU32 = AtomicU32::new(0);
    static T_FAST: AtomicU32 = AtomicU32::new(0);

    fn task_slow(_: usize) {
        SEQ.expect_and_replace(0, 1);
        T_SLOW.store(System::current_system_tick(), Ordering::Relaxed);
        System::sleep_ticks(100);
        let elapsed = System::current_system_tick() - T_SLOW.load(Ordering::Relaxed);
        assert!(elapsed >= 100, "woke after {elapsed} ticks");
        SEQ.expect_and_replace(3, 4);
        wren_port_std::shutdown::<SystemTraits>();
    }

    fn task_fast(_: usize) {
        SEQ.expect_and_replace(1, 2);
        T_FAST.store(System::current_system_tick(), Ordering::Relaxed);
        System::sleep_ticks(40);
        let elapsed = System::current_system_tick() - T_FAST.load(Ordering::Relaxed);
        assert!(elapsed >= 40, "woke after {elapsed} ticks");
        SEQ.expect_and_replace(2, 3);
    }

    #[test]
    fn sleep_lower_bound() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            let slow = System::task_create(
                "slow",
                TaskStack::from_storage(&STACK_SLOW),
                task_slow,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let fast = System::task_create(
                "fast",
                TaskStack::from_storage(&STACK_FAST),
                task_fast,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(slow, 4);
            System::scheduler_task_add(fast, 5);
        });
        assert_eq!(SEQ.get(), 4);
    }
}

/// Two tasks due at the same wake tick: the higher-priority one runs first.
mod wake_tie_priority {
    use super::SeqTracker;
    use wren_kernel::{
        suspend_condition, Condition, StackStorage, Suspend, SuspendConditionError, SuspendParam,
        TaskFlags, TaskStack,
    };

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_HI: StackStorage<4096> = StackStorage::new();
    static STACK_LO: StackStorage<4096> = StackStorage::new();
    static COND: Condition<SystemTraits> = wren_kernel::utils::Init::INIT;

    const WAKE_AT: u32 = 50;

    fn wait_until_wake_tick() -> Result<usize, SuspendConditionError> {
        let suspends = [Suspend::new(SuspendParam::None).with_deadline(WAKE_AT)];
        let conditions = [&COND];
        suspend_condition(&conditions, &suspends, false)
    }

    fn task_hi(_: usize) {
        SEQ.expect_and_replace(0, 1);
        assert_eq!(wait_until_wake_tick(), Err(SuspendConditionError::Timeout));
        // Both tasks became due at tick 50; the higher-priority one (this
        // one) must be scheduled first
        SEQ.expect_and_replace(2, 3);
    }

    fn task_lo(_: usize) {
        SEQ.expect_and_replace(1, 2);
        assert_eq!(wait_until_wake_tick(), Err(SuspendConditionError::Timeout));
        SEQ.expect_and_replace(3, 4);
        wren_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn wake_tie_priority() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            COND.init(0, None);
            let hi = System::task_create(
                "hi",
                TaskStack::from_storage(&STACK_HI),
                task_hi,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let lo = System::task_create(
                "lo",
                TaskStack::from_storage(&STACK_LO),
                task_lo,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(hi, 4);
            System::scheduler_task_add(lo, 5);
        });
        assert_eq!(SEQ.get(), 4);
    }
}

/// A released semaphore wakes the blocked higher-priority claimant, which
/// preempts the releaser and becomes the owner.
mod semaphore_contention {
    use super::SeqTracker;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wren_kernel::{Semaphore, StackStorage, TaskFlags, TaskStack, MAX_WAIT};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_HI: StackStorage<4096> = StackStorage::new();
    static STACK_LO: StackStorage<4096> = StackStorage::new();
    static SEM: Semaphore<SystemTraits> = wren_kernel::utils::Init::INIT;
    static HIGH_WAITING: AtomicBool = AtomicBool::new(false);

    fn task_hi(_: usize) {
        SEQ.expect_and_replace(0, 1);
        System::sleep_ticks(10);
        // `task_lo` owns the semaphore by now
        HIGH_WAITING.store(true, Ordering::Release);
        SEM.obtain(MAX_WAIT).unwrap();
        SEQ.expect_and_replace(3, 4);
        assert_eq!(SEM.count(), 0);
        assert_eq!(SEM.owner(), Some(System::current_task().unwrap()));
        SEM.release();
        wren_port_std::shutdown::<SystemTraits>();
    }

    fn task_lo(_: usize) {
        SEQ.expect_and_replace(1, 2);
        SEM.obtain(MAX_WAIT).unwrap();
        // Once the store below is visible, `task_hi` has already blocked:
        // it outranks us, so it ran from its wake until `obtain` parked it.
        // The tick read keeps a preemption point in the loop.
        while !HIGH_WAITING.load(Ordering::Acquire) {
            let _ = System::current_system_tick();
        }
        SEQ.expect_and_replace(2, 3);
        SEM.release();
        // `task_hi` preempts right here
        unreachable_after_shutdown();
    }

    fn unreachable_after_shutdown() {
        // The releaser is outranked from the release onwards; by the time it
        // would run again the simulation is over
        std::thread::park();
    }

    #[test]
    fn semaphore_contention() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            SEM.create(1);
            let hi = System::task_create(
                "hi",
                TaskStack::from_storage(&STACK_HI),
                task_hi,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let lo = System::task_create(
                "lo",
                TaskStack::from_storage(&STACK_LO),
                task_lo,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(hi, 3);
            System::scheduler_task_add(lo, 5);
        });
        assert_eq!(SEQ.get(), 4);
    }
}

/// A timed `obtain` on a held semaphore fails with `CONDITION_TIMEOUT` at
/// its deadline and leaves the task fully unqueued.
mod semaphore_timeout {
    use super::SeqTracker;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wren_kernel::{ObtainSemaphoreError, Semaphore, StackStorage, TaskFlags, TaskStack, MAX_WAIT};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_HOLDER: StackStorage<4096> = StackStorage::new();
    static STACK_CLAIMANT: StackStorage<4096> = StackStorage::new();
    static SEM: Semaphore<SystemTraits> = wren_kernel::utils::Init::INIT;
    static T0: AtomicU32 = AtomicU32::new(0);

    fn task_holder(_: usize) {
        SEQ.expect_and_replace(0, 1);
        SEM.obtain(MAX_WAIT).unwrap();
        T0.store(System::current_system_tick(), Ordering::Relaxed);
        System::sleep_ticks(500);
    }

    fn task_claimant(_: usize) {
        SEQ.expect_and_replace(1, 2);
        assert_eq!(SEM.obtain(50), Err(ObtainSemaphoreError::Timeout));
        let elapsed = System::current_system_tick() - T0.load(Ordering::Relaxed);
        assert!((50..200).contains(&elapsed), "timed out after {elapsed} ticks");
        // The semaphore is still held, and this task is back to normal
        // scheduling: an immediate poll fails and a sleep works
        assert_eq!(SEM.obtain(0), Err(ObtainSemaphoreError::Busy));
        System::sleep_ticks(5);
        SEQ.expect_and_replace(2, 3);
        wren_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn semaphore_timeout() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            SEM.create(1);
            let holder = System::task_create(
                "holder",
                TaskStack::from_storage(&STACK_HOLDER),
                task_holder,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let claimant = System::task_create(
                "claimant",
                TaskStack::from_storage(&STACK_CLAIMANT),
                task_claimant,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(holder, 4);
            System::scheduler_task_add(claimant, 5);
        });
        assert_eq!(SEQ.get(), 3);
    }
}

/// Destroying a semaphore resumes every waiter with `SEMAPHORE_DELETED`,
/// highest-priority waiter first.
mod semaphore_destroy {
    use super::SeqTracker;
    use wren_kernel::{ObtainSemaphoreError, Semaphore, StackStorage, TaskFlags, TaskStack, MAX_WAIT};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_OWNER: StackStorage<4096> = StackStorage::new();
    static STACK_W1: StackStorage<4096> = StackStorage::new();
    static STACK_W2: StackStorage<4096> = StackStorage::new();
    static SEM: Semaphore<SystemTraits> = wren_kernel::utils::Init::INIT;

    fn task_owner(_: usize) {
        SEQ.expect_and_replace(0, 1);
        SEM.obtain(MAX_WAIT).unwrap();
        System::sleep_ticks(30);
        // Both waiters are parked on the semaphore now
        SEQ.expect_and_replace(3, 4);
        SEM.destroy();
        // The waiters are ready but outranked by this task; yield the
        // processor so they can observe the deletion
        System::sleep_ticks(10);
        SEQ.expect_and_replace(6, 7);
        wren_port_std::shutdown::<SystemTraits>();
    }

    fn task_w1(_: usize) {
        SEQ.expect_and_replace(1, 2);
        assert_eq!(SEM.obtain(MAX_WAIT), Err(ObtainSemaphoreError::Deleted));
        SEQ.expect_and_replace(4, 5);
    }

    fn task_w2(_: usize) {
        SEQ.expect_and_replace(2, 3);
        assert_eq!(SEM.obtain(MAX_WAIT), Err(ObtainSemaphoreError::Deleted));
        SEQ.expect_and_replace(5, 6);
    }

    #[test]
    fn semaphore_destroy() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            SEM.create(1);
            let owner = System::task_create(
                "owner",
                TaskStack::from_storage(&STACK_OWNER),
                task_owner,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let w1 = System::task_create(
                "w1",
                TaskStack::from_storage(&STACK_W1),
                task_w1,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let w2 = System::task_create(
                "w2",
                TaskStack::from_storage(&STACK_W2),
                task_w2,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(owner, 4);
            System::scheduler_task_add(w1, 5);
            System::scheduler_task_add(w2, 6);
        });
        assert_eq!(SEQ.get(), 7);
    }
}

/// A preemption missed under the scheduler lock is deferred: the tick only
/// sets the drift flag, and `scheduler_unlock` performs the yield.
mod sched_drift {
    use super::SeqTracker;
    use wren_kernel::{StackStorage, TaskFlags, TaskStack};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_HI: StackStorage<4096> = StackStorage::new();
    static STACK_LO: StackStorage<4096> = StackStorage::new();

    fn task_hi(_: usize) {
        SEQ.expect_and_replace(0, 1);
        System::sleep_ticks(10);
        // Only reached once `task_lo` drops the scheduler lock
        SEQ.expect_and_replace(2, 3);
    }

    fn task_lo(_: usize) {
        SEQ.expect_and_replace(1, 2);
        System::scheduler_lock();
        // Busy-loop well past tick 10, where `task_hi` becomes ready and
        // would normally preempt this task
        while System::current_system_tick() < 30 {
            std::hint::spin_loop();
        }
        // Still running: the missed preemption was recorded, not taken
        assert_eq!(SEQ.get(), 2);
        // The unlock drives the deferred yield; `task_hi` runs before this
        // returns
        System::scheduler_unlock();
        SEQ.expect_and_replace(3, 4);
        wren_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn sched_drift() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            let hi = System::task_create(
                "hi",
                TaskStack::from_storage(&STACK_HI),
                task_hi,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let lo = System::task_create(
                "lo",
                TaskStack::from_storage(&STACK_LO),
                task_lo,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(hi, 3);
            System::scheduler_task_add(lo, 5);
        });
        assert_eq!(SEQ.get(), 4);
    }
}

/// Blocking fd reads park on the readiness condition, wake on
/// `data_available`, and teardown resumes them with `FS_NODE_DELETED`.
/// Non-blocking fds fail immediately with the would-block status.
mod fd_readiness {
    use super::SeqTracker;
    use wren_kernel::{FsError, FsFlags, FsNode, StackStorage, TaskFlags, TaskStack};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_READER: StackStorage<4096> = StackStorage::new();
    static STACK_PRODUCER: StackStorage<4096> = StackStorage::new();
    static FD: FsNode<SystemTraits> = wren_kernel::utils::Init::INIT;
    static FD_NB: FsNode<SystemTraits> = wren_kernel::utils::Init::INIT;

    fn device_read(node: &'static FsNode<SystemTraits>, buffer: &mut [u8]) -> usize {
        let payload = b"wren";
        let n = payload.len().min(buffer.len());
        buffer[..n].copy_from_slice(&payload[..n]);
        // One-shot device: the pending data is consumed by this read
        node.data_flushed();
        n
    }

    fn task_reader(_: usize) {
        SEQ.expect_and_replace(0, 1);

        // The non-blocking node reports would-block right away
        let mut buffer = [0u8; 16];
        assert_eq!(FD_NB.read(&mut buffer), Err(FsError::WouldBlock));

        // The blocking node parks this task until the producer signals
        let n = FD.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"wren");
        SEQ.expect_and_replace(2, 3);

        // Block again; this wait ends with the node's teardown
        assert_eq!(FD.read(&mut buffer), Err(FsError::NodeDeleted));
        SEQ.expect_and_replace(4, 5);
    }

    fn task_producer(_: usize) {
        SEQ.expect_and_replace(1, 2);
        // The reader outranks us: it consumes the data before this returns
        FD.data_available();
        SEQ.expect_and_replace(3, 4);
        FD.destroy();
        SEQ.expect_and_replace(5, 6);
        wren_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn fd_readiness() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            FD.register(FsFlags::BLOCK, Some(device_read), None, 0);
            FD_NB.register(FsFlags::empty(), Some(device_read), None, 0);
            let reader = System::task_create(
                "reader",
                TaskStack::from_storage(&STACK_READER),
                task_reader,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let producer = System::task_create(
                "producer",
                TaskStack::from_storage(&STACK_PRODUCER),
                task_producer,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(reader, 4);
            System::scheduler_task_add(producer, 5);
        });
        assert_eq!(SEQ.get(), 6);
    }
}

/// Registered idle work runs while the system is otherwise idle; runtime
/// registration is rejected when runtime updates are compiled out.
mod idle_work {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wren_kernel::{IdleWorkError, StackStorage, TaskFlags, TaskStack};

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 4,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static STACK_MAIN: StackStorage<4096> = StackStorage::new();
    static SWEEPS: AtomicUsize = AtomicUsize::new(0);

    fn bump(_data: usize) {
        SWEEPS.fetch_add(1, Ordering::Relaxed);
    }

    fn task_main(_: usize) {
        // Nothing else is ready; the idle task owns the processor and keeps
        // invoking the registered hook
        System::sleep_ticks(50);
        assert!(SWEEPS.load(Ordering::Relaxed) > 0);

        #[cfg(not(feature = "idle_runtime_update"))]
        assert_eq!(
            System::idle_add_work(bump, 1),
            Err(IdleWorkError::CannotUpdate)
        );
        #[cfg(feature = "idle_runtime_update")]
        System::idle_add_work(bump, 1).unwrap();

        wren_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn idle_work() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            System::idle_add_work(bump, 0).unwrap();
            let main = System::task_create(
                "main",
                TaskStack::from_storage(&STACK_MAIN),
                task_main,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(main, 5);
        });
    }
}

/// `suspend_condition` over several conditions returns the index of the
/// condition whose producer selected the waiter, with the wake status
/// readable from the suspend record.
mod suspend_resume_law {
    use super::SeqTracker;
    use wren_kernel::{
        resume_condition, suspend_condition, Condition, Resume, ResumeParam, ResultCode,
        StackStorage, Suspend, SuspendParam, TaskFlags, TaskStack,
    };

    wren_port_std::use_port!(struct SystemTraits {
        task_slots: 8,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static SEQ: SeqTracker = SeqTracker::new();
    static STACK_WAITER: StackStorage<4096> = StackStorage::new();
    static STACK_PRODUCER: StackStorage<4096> = StackStorage::new();
    static COND_A: Condition<SystemTraits> = wren_kernel::utils::Init::INIT;
    static COND_B: Condition<SystemTraits> = wren_kernel::utils::Init::INIT;

    fn task_waiter(_: usize) {
        SEQ.expect_and_replace(0, 1);
        let suspends = [
            Suspend::new(SuspendParam::None),
            Suspend::new(SuspendParam::None),
        ];
        let conditions = [&COND_A, &COND_B];
        let released_by = suspend_condition(&conditions, &suspends, false);
        assert_eq!(released_by, Ok(1));
        assert_eq!(suspends[1].status(), Some(ResultCode::TASK_RESUME));
        assert_eq!(suspends[0].status(), None);
        SEQ.expect_and_replace(2, 3);
        wren_port_std::shutdown::<SystemTraits>();
    }

    fn task_producer(_: usize) {
        SEQ.expect_and_replace(1, 2);
        let mut resume = Resume {
            status: ResultCode::TASK_RESUME,
            do_resume: None,
            param: ResumeParam::None,
        };
        // The waiter outranks us and finishes the assertion before this
        // call returns
        resume_condition(&COND_B, &mut resume).unwrap();
        std::thread::park();
    }

    #[test]
    fn suspend_resume_law() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            COND_A.init(0, None);
            COND_B.init(0, None);
            let waiter = System::task_create(
                "waiter",
                TaskStack::from_storage(&STACK_WAITER),
                task_waiter,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            let producer = System::task_create(
                "producer",
                TaskStack::from_storage(&STACK_PRODUCER),
                task_producer,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(waiter, 4);
            System::scheduler_task_add(producer, 5);
        });
        assert_eq!(SEQ.get(), 3);
    }
}

/// A task created with `RETURN_TO_SCHEDULER` is requeued when its entry
/// returns; a plain task finishes, can be retired, and its slot reused.
mod task_lifecycle {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use wren_kernel::{StackStorage, TaskFlags, TaskId, TaskStack};

    wren_port_std::use_port!(struct SystemTraits {
        // idle + looper + once + checker fill the pool completely
        task_slots: 4,
        idle_work_slots: 0,
        idle_task_stack_size: 4096,
    });
    type System = wren_kernel::System<SystemTraits>;

    static STACK_LOOPER: StackStorage<4096> = StackStorage::new();
    static STACK_ONCE: StackStorage<4096> = StackStorage::new();
    static STACK_CHECKER: StackStorage<4096> = StackStorage::new();
    static STACK_EXTRA: StackStorage<4096> = StackStorage::new();
    static LOOPER_RUNS: AtomicUsize = AtomicUsize::new(0);
    static ONCE_RUNS: AtomicUsize = AtomicUsize::new(0);
    static ONCE_ID: OnceLock<TaskId> = OnceLock::new();

    fn task_looper(_: usize) {
        LOOPER_RUNS.fetch_add(1, Ordering::Relaxed);
        System::sleep_ticks(3);
    }

    fn task_once(_: usize) {
        ONCE_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    fn task_checker(_: usize) {
        System::sleep_ticks(20);
        assert_eq!(ONCE_RUNS.load(Ordering::Relaxed), 1);
        assert!(LOOPER_RUNS.load(Ordering::Relaxed) >= 2);

        // The pool is full until the finished task is retired
        let stack = TaskStack::from_storage(&STACK_EXTRA);
        assert!(System::task_create("extra", stack, task_once, 0, TaskFlags::empty()).is_err());
        System::scheduler_task_remove(*ONCE_ID.get().unwrap());
        System::task_create("extra", stack, task_once, 0, TaskFlags::empty()).unwrap();

        wren_port_std::shutdown::<SystemTraits>();
    }

    #[test]
    fn task_lifecycle() {
        wren_port_std::port_boot::<SystemTraits>(|| {
            let looper = System::task_create(
                "looper",
                TaskStack::from_storage(&STACK_LOOPER),
                task_looper,
                0,
                TaskFlags::RETURN_TO_SCHEDULER,
            )
            .unwrap();
            let once = System::task_create(
                "once",
                TaskStack::from_storage(&STACK_ONCE),
                task_once,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            ONCE_ID.set(once).unwrap();
            let checker = System::task_create(
                "checker",
                TaskStack::from_storage(&STACK_CHECKER),
                task_checker,
                0,
                TaskFlags::empty(),
            )
            .unwrap();
            System::scheduler_task_add(looper, 6);
            System::scheduler_task_add(once, 5);
            System::scheduler_task_add(checker, 4);
        });
    }
}
