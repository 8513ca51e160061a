//! The tick source and the sleep queue
//!
//! Tick comparisons use modular 32-bit signed arithmetic so wrap-around
//! after 2³¹ ticks is transparent: `tick_cmp(a, b) >= 0` means "`a` is at or
//! after `b`" as long as the two ticks are less than 2³¹ apart.
use crate::{
    klock::{self, CpuLockTokenRefMut},
    task::{self, TaskSt, YieldReason},
    task_cb_by_id,
    utils::list::{self, LinkAdapter},
    KernelTraits, Priority, System, TaskId, Tick,
};

/// `INT32CMP`: signed distance from `b` to `a` in modular tick space.
pub(crate) fn tick_cmp(a: Tick, b: Tick) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Whether a newly inserted task must be placed before an existing node:
/// ascending wake tick, ties broken by priority (lower numeric value first),
/// FIFO among full ties.
fn new_sleeper_goes_first(
    existing_tick: Tick,
    existing_pri: Priority,
    new_tick: Tick,
    new_pri: Priority,
) -> bool {
    tick_cmp(existing_tick, new_tick) > 0
        || (existing_tick == new_tick && existing_pri > new_pri)
}

struct SleepLinks<'a, Traits: KernelTraits> {
    token: CpuLockTokenRefMut<'a, Traits>,
}

impl<Traits: KernelTraits> LinkAdapter<TaskId> for SleepLinks<'_, Traits> {
    fn next(&self, node: TaskId) -> Option<TaskId> {
        task_cb_by_id::<Traits>(node).link_sleep.get(&*self.token)
    }
    fn set_next(&mut self, node: TaskId, next: Option<TaskId>) {
        task_cb_by_id::<Traits>(node)
            .link_sleep
            .replace(&mut *self.token, next);
    }
}

/// Install `task` on the sleep queue with an absolute wake tick.
/// The caller must hold the CPU Lock (the sleep queue is mutated from the
/// tick interrupt).
pub(crate) fn sleep_add_to_list_abs<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
    wake_at: Tick,
) {
    let state = Traits::state();
    task_cb_by_id::<Traits>(task)
        .tick_sleep
        .replace(&mut *lock, wake_at);

    let mut head = state.sleep_queue.get(&*lock);
    {
        let mut links = SleepLinks::<Traits> {
            token: lock.borrow_mut(),
        };
        list::insert_sorted(&mut head, &mut links, task, |links, existing, new| {
            let e = task_cb_by_id::<Traits>(existing);
            let n = task_cb_by_id::<Traits>(new);
            new_sleeper_goes_first(
                e.tick_sleep.get(&*links.token),
                e.priority.get(&*links.token),
                n.tick_sleep.get(&*links.token),
                n.priority.get(&*links.token),
            )
        });
    }
    state.sleep_queue.replace(&mut *lock, head);
}

/// Install `task` on the sleep queue `ticks` ticks from now.
pub(crate) fn sleep_add_to_list<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
    ticks: Tick,
) {
    let wake_at = Traits::state()
        .tick_count
        .get(&*lock)
        .wrapping_add(ticks);
    sleep_add_to_list_abs(lock, task, wake_at);
}

/// Unlink `task` from the sleep queue, clearing its wake tick. Does nothing
/// if the task is not sleeping.
pub(crate) fn sleep_remove_from_list<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) {
    let state = Traits::state();
    let mut head = state.sleep_queue.get(&*lock);
    let removed = {
        let mut links = SleepLinks::<Traits> {
            token: lock.borrow_mut(),
        };
        list::remove(&mut head, &mut links, task)
    };
    if removed {
        state.sleep_queue.replace(&mut *lock, head);
        task_cb_by_id::<Traits>(task).tick_sleep.replace(&mut *lock, 0);
    }
}

/// Advance the tick counter. Returns `true` iff the head of the sleep queue
/// is now due, i.e. the scheduler should run.
pub(crate) fn process_system_tick<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let state = Traits::state();
    let now = state.tick_count.get(&*lock).wrapping_add(1);
    state.tick_count.replace(&mut *lock, now);

    match state.sleep_queue.get(&*lock).first {
        Some(head) => {
            tick_cmp(now, task_cb_by_id::<Traits>(head).tick_sleep.get(&*lock)) >= 0
        }
        None => false,
    }
}

/// Unlink one due, fully suspended task from the sleep queue. Tasks that are
/// due but still mid-suspension (`TO_BE_SUSPENDED`) are skipped; the sorted
/// order lets the walk stop at the first task not yet due.
fn take_due_sleeper<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<TaskId> {
    let state = Traits::state();
    let now = state.tick_count.get(&*lock);
    let mut head = state.sleep_queue.get(&*lock);

    let taken = {
        let mut links = SleepLinks::<Traits> {
            token: lock.borrow_mut(),
        };
        let mut prev: Option<TaskId> = None;
        let mut cur = head.first;
        loop {
            let Some(c) = cur else { break None };
            let task_cb = task_cb_by_id::<Traits>(c);
            if tick_cmp(now, task_cb.tick_sleep.get(&*links.token)) < 0 {
                break None;
            }
            let next = links.next(c);
            if task_cb.st.get(&*links.token) == TaskSt::Suspended {
                match prev {
                    Some(p) => links.set_next(p, next),
                    None => head.first = next,
                }
                if head.last == Some(c) {
                    head.last = prev;
                }
                links.set_next(c, None);
                break Some(c);
            }
            prev = cur;
            cur = next;
        }
    };

    if taken.is_some() {
        state.sleep_queue.replace(&mut *lock, head);
    }
    taken
}

/// Move every due sleeper back to the ready queue with reason `SLEEP`.
pub(crate) fn process_due_sleepers<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    while let Some(task) = take_due_sleeper::<Traits>(lock.borrow_mut()) {
        task::yield_task(lock.borrow_mut(), task, YieldReason::Sleep);
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// The number of system ticks elapsed since boot.
    pub fn current_system_tick() -> Tick {
        // The counter is advanced from the tick interrupt, so the read is
        // bracketed by the CPU Lock
        let lock =
            klock::lock_cpu::<Traits>().expect("current_system_tick with CPU Lock active");
        Traits::state().tick_count.get(&*lock)
    }

    /// Suspend the current task for the given number of system ticks.
    pub fn sleep_ticks(ticks: Tick) {
        Self::scheduler_lock();

        let mut lock = klock::lock_cpu::<Traits>().expect("sleep_ticks with CPU Lock active");
        let cur = Traits::state()
            .running_task
            .get(&*lock)
            .expect("sleep_ticks requires a task context");
        sleep_add_to_list(lock.borrow_mut(), cur, ticks);

        // Control returns once the wake tick has been reached
        task::wait_until_woken_up(lock.borrow_mut());
        drop(lock);

        Self::scheduler_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_cmp_is_modular() {
        assert_eq!(tick_cmp(5, 3), 2);
        assert_eq!(tick_cmp(3, 5), -2);
        // Comparisons stay correct across the 2³² boundary
        assert!(tick_cmp(2, u32::MAX - 1) > 0);
        assert!(tick_cmp(u32::MAX - 1, 2) < 0);
        assert_eq!(tick_cmp(0x8000_0000, 0), i32::MIN);
    }

    #[test]
    fn sleep_order_ties_break_by_priority() {
        // Earlier wake tick first
        assert!(new_sleeper_goes_first(10, 5, 9, 5));
        assert!(!new_sleeper_goes_first(9, 5, 10, 5));
        // Same wake tick: the higher-priority (numerically lower) task wins
        assert!(new_sleeper_goes_first(10, 6, 10, 5));
        // Full tie keeps FIFO order (the new task goes behind)
        assert!(!new_sleeper_goes_first(10, 5, 10, 5));
        // Wrap-around: a wake tick just past the boundary is "later"
        assert!(new_sleeper_goes_first(1, 5, u32::MAX, 5));
    }
}
