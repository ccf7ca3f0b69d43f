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

//! Process lifecycle states and the transitions between them.
//!
//! ```text
//!               ┌─ sem_wait ─► BLOCKED ─ sem_post ─┐
//!               │                                  ▼
//!   (start) ─► WAITING ◄──── signal SIGCONT ──── STOPPED
//!               ▲                                  ▲
//!               │ time-slice                       │ SIGSTOP/SIGTSTP/SIGTTIN/SIGTTOU
//!               ▼                                  │
//!            RUNNING ──── signal SIGKILL / exit ─► TERMINATED
//! ```

/// A process's scheduling state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
	/// Runnable, not currently holding the CPU.
	Waiting,
	/// Currently holding the CPU.
	Running,
	/// Blocked on a semaphore.
	Blocked,
	/// Stopped by a job-control signal, awaiting `SIGCONT`.
	Stopped,
	/// Exited; retained in the process table until reaped by a parent's `waitpid`.
	Terminated,
}

impl State {
	/// Tells whether a process in this state is eligible for the scheduler's round-robin
	/// selection.
	pub fn is_runnable(&self) -> bool {
		matches!(self, Self::Waiting | Self::Running)
	}
}
