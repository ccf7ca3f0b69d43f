/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! A binary semaphore that hands its single slot to waiters strictly in FIFO order.
//!
//! Grounded on the reference kernel's sleeping-mutex pattern (push onto a wait queue, transition
//! to a blocked state, loop until rescheduled) but keyed by PID against the scheduler's process
//! table instead of an intrusive list of `Process` nodes, since this core's processes live in a
//! `BTreeMap` rather than being linked directly into wait-queue nodes.

use crate::process::{pid::Pid, scheduler, state::State};
use alloc::collections::VecDeque;
use utils::lock::IntMutex;

struct Inner {
	/// The PID currently holding the semaphore, if any.
	holder: Option<Pid>,
	/// PIDs waiting their turn, in arrival order.
	queue: VecDeque<Pid>,
}

/// A FIFO-fair binary semaphore.
pub struct Semaphore {
	inner: IntMutex<Inner>,
}

impl Semaphore {
	/// Creates a new, unheld semaphore.
	pub const fn new() -> Self {
		Self {
			inner: IntMutex::new(Inner {
				holder: None,
				queue: VecDeque::new(),
			}),
		}
	}

	/// Blocks `pid` until it becomes the holder.
	///
	/// If the semaphore is free, `pid` becomes the holder immediately. Otherwise `pid` is
	/// enqueued, the owning process transitions to [`State::Blocked`] (remembering its previous
	/// state for `post` to restore), and the caller must yield to the scheduler in a loop until
	/// it observes itself holding the semaphore.
	pub fn wait(&self, pid: Pid) {
		let mut inner = self.inner.lock();
		if inner.holder.is_none() && inner.queue.is_empty() {
			inner.holder = Some(pid);
			return;
		}
		inner.queue.push_back(pid);
		drop(inner);
		if let Some(proc) = scheduler::get().lock().get(pid) {
			proc.lock().set_state(State::Blocked);
		}
	}

	/// Tells whether `pid` currently holds the semaphore.
	pub fn is_holder(&self, pid: Pid) -> bool {
		self.inner.lock().holder == Some(pid)
	}

	/// Releases the semaphore, handing it to the next queued waiter (if any) and restoring that
	/// waiter's previous scheduling state.
	pub fn post(&self) {
		let next = {
			let mut inner = self.inner.lock();
			inner.holder = inner.queue.pop_front();
			inner.holder
		};
		if let Some(pid) = next {
			if let Some(proc) = scheduler::get().lock().get(pid) {
				let mut proc = proc.lock();
				let prev = proc.prev_state();
				proc.set_state(prev);
			}
		}
	}

	/// Cancels a waiter, e.g. because its process was just terminated.
	///
	/// If `pid` was the holder, the semaphore is handed to the next queued waiter whose
	/// `prev_state` is not [`State::Terminated`] — a dying process is never handed the lock.
	pub fn remove(&self, pid: Pid) {
		let mut inner = self.inner.lock();
		inner.queue.retain(|&p| p != pid);
		if inner.holder != Some(pid) {
			return;
		}
		loop {
			inner.holder = inner.queue.pop_front();
			let Some(candidate) = inner.holder else {
				break;
			};
			let Some(proc) = scheduler::get().lock().get(candidate) else {
				continue;
			};
			let mut proc = proc.lock();
			let prev = proc.prev_state();
			if prev == State::Terminated {
				continue;
			}
			proc.set_state(prev);
			break;
		}
	}
}

impl Default for Semaphore {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::process::{mem_space::MemSpace, Process};

	fn spawn() -> Pid {
		let proc = Process::new(None, MemSpace::new()).unwrap();
		let pid = proc.pid();
		scheduler::get().lock().add(proc);
		pid
	}

	#[test_case]
	fn fifo_order() {
		let sem = Semaphore::new();
		let a = spawn();
		let b = spawn();
		let c = spawn();
		sem.wait(a);
		sem.wait(b);
		sem.wait(c);
		assert!(sem.is_holder(a));
		sem.post();
		assert!(sem.is_holder(b));
		sem.post();
		assert!(sem.is_holder(c));
	}

	#[test_case]
	fn remove_holder_hands_to_next_waiter() {
		let sem = Semaphore::new();
		let a = spawn();
		let b = spawn();
		sem.wait(a);
		sem.wait(b);
		assert!(sem.is_holder(a));
		sem.remove(a);
		assert!(sem.is_holder(b));
	}

	#[test_case]
	fn remove_queued_waiter_does_not_disturb_holder() {
		let sem = Semaphore::new();
		let a = spawn();
		let b = spawn();
		let c = spawn();
		sem.wait(a);
		sem.wait(b);
		sem.wait(c);
		sem.remove(b);
		assert!(sem.is_holder(a));
		sem.post();
		assert!(sem.is_holder(c));
	}
}
