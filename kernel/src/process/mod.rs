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

//! A process is a task the scheduler can run: a PID, a memory space, a saved register context and
//! a signal disposition table.

pub mod mem_space;
pub mod pid;
pub mod regs;
pub mod scheduler;
pub mod semaphore;
pub mod signal;
pub mod state;

use mem_space::MemSpace;
use pid::Pid;
use regs::Regs;
use signal::{Signal, SignalHandlers};
use state::State;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use utils::errno::AllocResult;

/// A process control block.
pub struct Process {
	pid: Pid,
	ppid: Option<Pid>,
	children: Vec<Pid>,
	state: State,
	/// The state to restore a [`State::Blocked`] process to once unblocked.
	prev_state: State,
	/// The exit status, set once the process has reached [`State::Terminated`].
	exit_status: Option<i32>,
	mem_space: MemSpace,
	regs: Regs,
	signal_handlers: SignalHandlers,
	pending_signals: VecDeque<Signal>,
}

impl Process {
	/// Creates a new process with the given parent and memory space, in state
	/// [`State::Waiting`].
	pub fn new(ppid: Option<Pid>, mem_space: MemSpace) -> AllocResult<Self> {
		Ok(Self {
			pid: pid::alloc()?,
			ppid,
			children: Vec::new(),
			state: State::Waiting,
			prev_state: State::Waiting,
			exit_status: None,
			mem_space,
			regs: Regs::default(),
			signal_handlers: SignalHandlers::default(),
			pending_signals: VecDeque::new(),
		})
	}

	/// Builds a process with an explicit `pid` rather than one drawn from [`pid::alloc`].
	///
	/// PID allocation is a single global counter shared by every test in the binary, so a test
	/// that needs a specific PID (e.g. to stand in for `init`) cannot get one through [`Self::new`]
	/// reliably. Test-only.
	#[cfg(test)]
	pub fn new_with_pid(pid: Pid, ppid: Option<Pid>, mem_space: MemSpace) -> Self {
		Self {
			pid,
			ppid,
			children: Vec::new(),
			state: State::Waiting,
			prev_state: State::Waiting,
			exit_status: None,
			mem_space,
			regs: Regs::default(),
			signal_handlers: SignalHandlers::default(),
			pending_signals: VecDeque::new(),
		}
	}

	/// Returns the process's PID.
	pub fn pid(&self) -> Pid {
		self.pid
	}

	/// Returns the parent's PID, if any (the idle and init processes have none).
	pub fn ppid(&self) -> Option<Pid> {
		self.ppid
	}

	/// Sets the parent's PID. Used to reparent a child to `init` when its original parent exits.
	pub fn set_ppid(&mut self, ppid: Option<Pid>) {
		self.ppid = ppid;
	}

	/// Returns the PIDs of this process's living children.
	pub fn children(&self) -> &[Pid] {
		&self.children
	}

	/// Returns the current scheduling state.
	pub fn state(&self) -> State {
		self.state
	}

	/// Returns the state a blocked process will be restored to once unblocked.
	pub fn prev_state(&self) -> State {
		self.prev_state
	}

	/// Returns the exit status, if the process has terminated.
	pub fn exit_status(&self) -> Option<i32> {
		self.exit_status
	}

	/// Returns the process's saved register snapshot.
	pub fn regs(&self) -> &Regs {
		&self.regs
	}

	/// Returns a mutable reference to the process's saved register snapshot.
	pub fn regs_mut(&mut self) -> &mut Regs {
		&mut self.regs
	}

	/// Returns the process's memory space.
	pub fn mem_space(&self) -> &MemSpace {
		&self.mem_space
	}

	/// Returns a mutable reference to the process's memory space.
	pub fn mem_space_mut(&mut self) -> &mut MemSpace {
		&mut self.mem_space
	}

	/// Returns the process's signal disposition table.
	pub fn signal_handlers(&self) -> &SignalHandlers {
		&self.signal_handlers
	}

	/// Returns a mutable reference to the process's signal disposition table.
	pub fn signal_handlers_mut(&mut self) -> &mut SignalHandlers {
		&mut self.signal_handlers
	}

	/// Transitions the process to `new`, recording the current state as [`Self::prev_state`] when
	/// moving into [`State::Blocked`] so a later `sem_post` knows what to restore.
	pub fn set_state(&mut self, new: State) {
		if new == State::Blocked {
			self.prev_state = self.state;
		}
		self.state = new;
	}

	/// Pops the next pending signal, if any, in arrival order.
	pub fn pop_pending_signal(&mut self) -> Option<Signal> {
		self.pending_signals.pop_front()
	}

	/// Puts `signal` back at the front of the pending queue.
	///
	/// Used when a tick resolves a pending signal to [`signal::SignalAction::User`]: dispatching
	/// into the handler is the syscall/exec layer's job, which this core does not own, so the
	/// signal is left queued for that dispatcher instead of being silently dropped.
	pub fn requeue_signal(&mut self, signal: Signal) {
		self.pending_signals.push_front(signal);
	}

	/// Enqueues `signal` for delivery and, for signals whose disposition cannot be deferred
	/// (`SIGKILL` terminates unconditionally, `SIGSTOP` unconditionally stops), applies it
	/// immediately rather than waiting for the next scheduler tick.
	pub fn kill(&mut self, signal: Signal) {
		match signal {
			Signal::SIGKILL => {
				self.exit(128 + signal.get_id() as i32);
				return;
			}
			Signal::SIGSTOP => {
				self.set_state(State::Stopped);
				return;
			}
			_ => {}
		}
		self.pending_signals.push_back(signal);
	}

	/// Sets the exit status and transitions to [`State::Terminated`].
	///
	/// Living children are reparented to `init` by the caller, which has visibility into the
	/// scheduler's full process table; a single [`Process`] only knows its own child list.
	pub fn exit(&mut self, status: i32) {
		self.exit_status = Some(status);
		self.set_state(State::Terminated);
	}

	/// Tells whether the process has reaped all knowledge it needs to report to a `waitpid`
	/// caller, i.e. it has terminated.
	pub fn is_terminated(&self) -> bool {
		self.state == State::Terminated
	}

	/// Records `child` as one of this process's children.
	pub fn add_child(&mut self, child: Pid) {
		self.children.push(child);
	}

	/// Removes `child` from this process's child list, e.g. once reaped.
	pub fn remove_child(&mut self, child: Pid) {
		self.children.retain(|&p| p != child);
	}
}

/// Duplicates `parent` into a new child process: the memory space is copied, the saved registers
/// are copied verbatim except `eax`, which is zeroed so the child observes a `fork` return value
/// of `0`. The child starts in [`State::Waiting`].
pub fn process_clone(parent: &mut Process) -> AllocResult<Process> {
	let mem_space = parent.mem_space.try_clone()?;
	let mut child = Process::new(Some(parent.pid), mem_space)?;
	child.regs = parent.regs.clone();
	child.regs.eax = 0;
	parent.add_child(child.pid);
	Ok(child)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test_case]
	fn fork_sets_child_return_value_and_waiting() {
		let mut parent = Process::new(None, MemSpace::new()).unwrap();
		let child = process_clone(&mut parent).unwrap();
		assert_eq!(child.regs().eax, 0);
		assert_eq!(child.state(), State::Waiting);
		assert_eq!(child.ppid(), Some(parent.pid()));
		assert_eq!(parent.children(), &[child.pid()]);
	}

	#[test_case]
	fn exit_sets_status_and_terminates() {
		let mut proc = Process::new(None, MemSpace::new()).unwrap();
		proc.exit(42);
		assert_eq!(proc.exit_status(), Some(42));
		assert!(proc.is_terminated());
	}

	#[test_case]
	fn sigkill_terminates_unconditionally() {
		let mut proc = Process::new(None, MemSpace::new()).unwrap();
		proc.kill(Signal::SIGKILL);
		assert!(proc.is_terminated());
	}

	#[test_case]
	fn blocked_remembers_prev_state() {
		let mut proc = Process::new(None, MemSpace::new()).unwrap();
		proc.set_state(State::Running);
		proc.set_state(State::Blocked);
		assert_eq!(proc.prev_state(), State::Running);
		proc.set_state(proc.prev_state());
		assert_eq!(proc.state(), State::Running);
	}
}
