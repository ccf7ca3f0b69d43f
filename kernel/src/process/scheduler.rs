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

//! The scheduler interrupts the running process on every PIT tick and switches to the next
//! runnable one, round-robin over the process table.
//!
//! Unlike the reference implementation, there is no priority/quantum heuristic here: accounting
//! and quotas are out of scope, so every `WAITING`/`RUNNING` process gets exactly one tick before
//! the next is picked.

use crate::process::{
	pid::{Pid, INIT_PID},
	signal::SignalAction,
	state::State,
	Process,
};
use alloc::{collections::BTreeMap, sync::Arc};
use utils::lock::IntMutex;

/// The process scheduler: the single source of truth for which process is current and which are
/// runnable.
pub struct Scheduler {
	/// All registered processes, keyed by PID.
	processes: BTreeMap<Pid, Arc<IntMutex<Process>>>,
	/// The PID of the process currently holding the CPU, if any.
	current: Option<Pid>,
	/// The total number of ticks delivered since boot.
	total_ticks: u64,
}

impl Scheduler {
	/// Creates a new, empty scheduler.
	pub const fn new() -> Self {
		Self {
			processes: BTreeMap::new(),
			current: None,
			total_ticks: 0,
		}
	}

	/// Returns the total number of ticks delivered since boot.
	pub fn total_ticks(&self) -> u64 {
		self.total_ticks
	}

	/// Registers `process` with the scheduler.
	pub fn add(&mut self, process: Process) -> Arc<IntMutex<Process>> {
		let pid = process.pid();
		let handle = Arc::new(IntMutex::new(process));
		self.processes.insert(pid, handle.clone());
		handle
	}

	/// Removes the process with the given PID from the table.
	///
	/// Used once a terminated process has been reaped by its parent's `waitpid`.
	pub fn remove(&mut self, pid: Pid) {
		self.processes.remove(&pid);
		if self.current == Some(pid) {
			self.current = None;
		}
	}

	/// Returns the process with the given PID, if registered.
	pub fn get(&self, pid: Pid) -> Option<Arc<IntMutex<Process>>> {
		self.processes.get(&pid).cloned()
	}

	/// Returns the currently running process, if any.
	pub fn current(&self) -> Option<Arc<IntMutex<Process>>> {
		self.current.and_then(|pid| self.get(pid))
	}

	/// Returns the number of processes currently registered.
	pub fn len(&self) -> usize {
		self.processes.len()
	}

	/// Returns whether no process is registered.
	pub fn is_empty(&self) -> bool {
		self.processes.is_empty()
	}

	/// Picks the next runnable process after `after` (exclusive), wrapping around to the start of
	/// the table if none is found past it.
	fn next_runnable(&self, after: Option<Pid>) -> Option<Pid> {
		let is_runnable = |(_, p): &(&Pid, &Arc<IntMutex<Process>>)| p.lock().state().is_runnable();
		let past = after.and_then(|pid| {
			self.processes
				.range((core::ops::Bound::Excluded(pid), core::ops::Bound::Unbounded))
				.find(is_runnable)
		});
		past.or_else(|| self.processes.iter().find(is_runnable))
			.map(|(pid, _)| *pid)
	}

	/// Terminates the process `pid` with the given exit `status` and reparents its living children
	/// to `init`.
	///
	/// A single [`Process`] only knows its own child list, not whether `init` is registered, so
	/// this free-function-like step lives on the scheduler rather than on [`Process::exit`].
	pub fn exit(&mut self, pid: Pid, status: i32) {
		let Some(proc) = self.get(pid) else {
			return;
		};
		let children = {
			let mut proc = proc.lock();
			proc.exit(status);
			proc.children().to_vec()
		};
		let init_alive = pid != INIT_PID && self.get(INIT_PID).is_some();
		for child in children {
			if let Some(child_proc) = self.get(child) {
				child_proc
					.lock()
					.set_ppid(init_alive.then_some(INIT_PID));
			}
			if init_alive {
				if let Some(init) = self.get(INIT_PID) {
					init.lock().add_child(child);
				}
			}
		}
	}

	/// Returns the PID of the first terminated child of `parent`, if any, i.e. a child a
	/// `waitpid(-1, ...)` call on `parent` could reap immediately.
	///
	/// Blocking until a child terminates and consuming the syscall's `status` output pointer are
	/// both jobs of the syscall dispatcher this core does not own; this only answers the
	/// non-blocking half of that query.
	pub fn find_terminated_child(&self, parent: Pid) -> Option<Pid> {
		let proc = self.get(parent)?;
		let proc = proc.lock();
		proc.children()
			.iter()
			.copied()
			.find(|&child| self.get(child).is_some_and(|p| p.lock().is_terminated()))
	}

	/// Delivers one scheduler tick.
	///
	/// If the current process has a pending signal, its disposition is resolved and applied
	/// (terminate/stop/continue/ignore, or left for the caller to dispatch into a handler for
	/// [`SignalAction::User`]). Then the next runnable process is selected and becomes current.
	///
	/// Returns the PID of the process that is current after the tick, or `None` if no process is
	/// runnable.
	pub fn tick(&mut self) -> Option<Pid> {
		self.total_ticks += 1;
		if let Some(pid) = self.current {
			let mut terminate_status = None;
			if let Some(proc) = self.get(pid) {
				let mut proc = proc.lock();
				if let Some(signal) = proc.pop_pending_signal() {
					match proc.signal_handlers().resolve(&signal) {
						SignalAction::Default => unreachable!("resolve() never returns Default"),
						SignalAction::User(_) => proc.requeue_signal(signal),
						SignalAction::Ignore => {}
						SignalAction::Terminate => terminate_status = Some(128 + signal.get_id() as i32),
						SignalAction::Stop => proc.set_state(State::Stopped),
						SignalAction::Continue => proc.set_state(State::Waiting),
					}
				}
			}
			// `exit` reparents children under the scheduler's full process table, which a process
			// lock alone does not have visibility into, so it runs after `proc`'s lock is dropped.
			if let Some(status) = terminate_status {
				self.exit(pid, status);
			}
		}
		let next = self.next_runnable(self.current);
		if let Some(pid) = next {
			if let Some(proc) = self.get(pid) {
				proc.lock().set_state(State::Running);
			}
		}
		self.current = next;
		next
	}
}

impl Default for Scheduler {
	fn default() -> Self {
		Self::new()
	}
}

/// The global scheduler instance.
static SCHEDULER: IntMutex<Scheduler> = IntMutex::new(Scheduler::new());

/// Returns the global scheduler.
pub fn get() -> &'static IntMutex<Scheduler> {
	&SCHEDULER
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::process::{mem_space::MemSpace, process_clone};

	fn make_process(sched: &mut Scheduler) -> Pid {
		let proc = Process::new(None, MemSpace::new()).unwrap();
		let pid = proc.pid();
		sched.add(proc);
		pid
	}

	#[test_case]
	fn round_robin_cycles_through_all() {
		let mut sched = Scheduler::new();
		let pids: alloc::vec::Vec<Pid> = (0..3).map(|_| make_process(&mut sched)).collect();
		let mut seen = alloc::vec::Vec::new();
		for _ in 0..pids.len() {
			seen.push(sched.tick().unwrap());
		}
		seen.sort_unstable();
		let mut expected = pids.clone();
		expected.sort_unstable();
		assert_eq!(seen, expected);
		// wraps back to the start
		assert_eq!(sched.tick(), Some(pids[0]));
	}

	#[test_case]
	fn empty_scheduler_ticks_to_none() {
		let mut sched = Scheduler::new();
		assert_eq!(sched.tick(), None);
	}

	#[test_case]
	fn default_disposition_terminates_within_one_tick() {
		use crate::process::signal::Signal;
		let mut sched = Scheduler::new();
		let pid = make_process(&mut sched);
		sched.tick(); // `pid` becomes current; nothing pending yet.
		sched.get(pid).unwrap().lock().kill(Signal::SIGTERM);
		sched.tick(); // resolves the pending signal for the now-current `pid`.
		assert_eq!(sched.get(pid).unwrap().lock().state(), State::Terminated);
	}

	#[test_case]
	fn exit_reparents_living_children_to_init() {
		use crate::process::pid::INIT_PID;
		let mut sched = Scheduler::new();
		let init = Process::new_with_pid(INIT_PID, None, MemSpace::new());
		sched.add(init);
		let mut parent = Process::new(Some(INIT_PID), MemSpace::new()).unwrap();
		let parent_pid = parent.pid();
		let child = process_clone(&mut parent).unwrap();
		let child_pid = child.pid();
		sched.add(parent);
		sched.add(child);

		sched.exit(parent_pid, 0);

		let child_proc = sched.get(child_pid).unwrap();
		assert_eq!(child_proc.lock().ppid(), Some(INIT_PID));
		let init_proc = sched.get(INIT_PID).unwrap();
		assert!(init_proc.lock().children().contains(&child_pid));
	}

	#[test_case]
	fn exit_orphans_children_when_init_is_not_registered() {
		let mut sched = Scheduler::new();
		let mut parent = Process::new(None, MemSpace::new()).unwrap();
		let parent_pid = parent.pid();
		let child = process_clone(&mut parent).unwrap();
		let child_pid = child.pid();
		sched.add(parent);
		sched.add(child);

		sched.exit(parent_pid, 0);

		assert_eq!(sched.get(child_pid).unwrap().lock().ppid(), None);
	}

	#[test_case]
	fn find_terminated_child_reports_only_terminated_ones() {
		let mut sched = Scheduler::new();
		let mut parent = Process::new(None, MemSpace::new()).unwrap();
		let parent_pid = parent.pid();
		let running_child = process_clone(&mut parent).unwrap();
		let dying_child = process_clone(&mut parent).unwrap();
		let dying_pid = dying_child.pid();
		sched.add(parent);
		sched.add(running_child);
		sched.add(dying_child);

		assert_eq!(sched.find_terminated_child(parent_pid), None);
		sched.exit(dying_pid, 42);
		assert_eq!(sched.find_terminated_child(parent_pid), Some(dying_pid));
	}

	#[test_case]
	fn fork_then_default_sigterm_is_observed_by_parent() {
		use crate::process::signal::Signal;
		let mut sched = Scheduler::new();
		let mut parent = Process::new(None, MemSpace::new()).unwrap();
		let parent_pid = parent.pid();
		let child = process_clone(&mut parent).unwrap();
		let child_pid = child.pid();
		sched.add(parent);
		sched.add(child);

		assert_eq!(sched.find_terminated_child(parent_pid), None);
		sched.tick(); // round-robin starts at the lower PID: parent becomes current.
		sched.tick(); // child becomes current; nothing pending yet.
		sched.get(child_pid).unwrap().lock().kill(Signal::SIGTERM);
		sched.tick(); // resolves the signal: child terminates and is reparented/reaped via `exit`.

		assert_eq!(sched.find_terminated_child(parent_pid), Some(child_pid));
	}

	#[test_case]
	fn user_disposition_is_left_queued_for_a_dispatcher() {
		use crate::process::signal::{Signal, SignalAction};
		let mut sched = Scheduler::new();
		let pid = make_process(&mut sched);
		sched.tick(); // `pid` becomes current; nothing pending yet.
		{
			let proc = sched.get(pid).unwrap();
			let mut proc = proc.lock();
			proc.signal_handlers_mut()
				.set(&Signal::SIGUSR1, SignalAction::User(0x1000));
			proc.kill(Signal::SIGUSR1);
		}
		sched.tick();
		let proc = sched.get(pid).unwrap();
		let mut proc = proc.lock();
		assert_eq!(proc.pop_pending_signal(), Some(Signal::SIGUSR1));
	}
}
