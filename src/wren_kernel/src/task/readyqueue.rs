//! Task ready queue implementation (internal use only).
//!
//! A single list sorted ascending by priority. A task is always inserted
//! behind every ready task of equal priority, which yields round-robin-on-
//! yield within a priority while keeping higher priorities absolutely
//! preferred.
use crate::{
    klock::CpuLockTokenRefMut,
    task_cb_by_id,
    utils::list::{self, LinkAdapter},
    KernelTraits, TaskId,
};

struct ReadyLinks<'a, Traits: KernelTraits> {
    token: CpuLockTokenRefMut<'a, Traits>,
}

impl<Traits: KernelTraits> LinkAdapter<TaskId> for ReadyLinks<'_, Traits> {
    fn next(&self, node: TaskId) -> Option<TaskId> {
        task_cb_by_id::<Traits>(node).link_ready.get(&*self.token)
    }
    fn set_next(&mut self, node: TaskId, next: Option<TaskId>) {
        task_cb_by_id::<Traits>(node)
            .link_ready
            .replace(&mut *self.token, next);
    }
}

/// Insert `task` by priority, behind every equal-priority task.
pub(crate) fn push<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, task: TaskId) {
    let state = Traits::state();
    let mut head = state.ready_queue.get(&*lock);
    {
        let mut links = ReadyLinks::<Traits> {
            token: lock.borrow_mut(),
        };
        list::insert_sorted(&mut head, &mut links, task, |links, existing, new| {
            let existing_pri = task_cb_by_id::<Traits>(existing)
                .priority
                .get(&*links.token);
            let new_pri = task_cb_by_id::<Traits>(new).priority.get(&*links.token);
            existing_pri > new_pri
        });
    }
    state.ready_queue.replace(&mut *lock, head);
}

/// The highest-priority ready task, if any.
pub(crate) fn front<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> Option<TaskId> {
    Traits::state().ready_queue.get(&*lock).first
}

/// Detach and return the highest-priority ready task.
pub(crate) fn pop<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<TaskId> {
    let state = Traits::state();
    let mut head = state.ready_queue.get(&*lock);
    let popped = {
        let mut links = ReadyLinks::<Traits> {
            token: lock.borrow_mut(),
        };
        list::pop_front(&mut head, &mut links)
    };
    state.ready_queue.replace(&mut *lock, head);
    popped
}
