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

//! POSIX-style signal numbers and dispositions.
//!
//! Unlike the upstream implementation's function-pointer dispatch table, a process's disposition
//! for a given signal is a single tagged [`SignalAction`]: [`SignalAction::Default`] defers to
//! [`Signal::default_action`], [`SignalAction::User`] carries the handler address a dispatcher
//! would jump to, and the remaining variants pin the disposition to one fixed outcome regardless
//! of the signal's usual default (as `sigaction` allows).

use utils::errno;
use utils::errno::Errno;

/// The number of signals, including the unused slot `0`.
pub const SIGNALS_COUNT: usize = 32;

/// A POSIX signal number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
	/// Hangup.
	SIGHUP,
	/// Interrupt.
	SIGINT,
	/// Quit.
	SIGQUIT,
	/// Illegal instruction.
	SIGILL,
	/// Trace/breakpoint trap.
	SIGTRAP,
	/// Abort.
	SIGABRT,
	/// Bus error.
	SIGBUS,
	/// Floating point exception.
	SIGFPE,
	/// Kill.
	SIGKILL,
	/// User-defined signal 1.
	SIGUSR1,
	/// Segmentation fault.
	SIGSEGV,
	/// User-defined signal 2.
	SIGUSR2,
	/// Broken pipe.
	SIGPIPE,
	/// Alarm clock.
	SIGALRM,
	/// Termination.
	SIGTERM,
	/// Child status changed.
	SIGCHLD,
	/// Continue.
	SIGCONT,
	/// Stop.
	SIGSTOP,
	/// Terminal stop.
	SIGTSTP,
	/// Background read from control terminal.
	SIGTTIN,
	/// Background write to control terminal.
	SIGTTOU,
	/// Urgent condition on socket.
	SIGURG,
	/// Virtual timer expired.
	SIGVTALRM,
	/// Profiling timer expired.
	SIGPROF,
	/// Pollable event.
	SIGPOLL,
	/// Bad system call.
	SIGSYS,
}

impl TryFrom<u8> for Signal {
	type Error = Errno;

	fn try_from(id: u8) -> Result<Self, Self::Error> {
		Ok(match id {
			1 => Self::SIGHUP,
			2 => Self::SIGINT,
			3 => Self::SIGQUIT,
			4 => Self::SIGILL,
			5 => Self::SIGTRAP,
			6 => Self::SIGABRT,
			7 => Self::SIGBUS,
			8 => Self::SIGFPE,
			9 => Self::SIGKILL,
			10 => Self::SIGUSR1,
			11 => Self::SIGSEGV,
			12 => Self::SIGUSR2,
			13 => Self::SIGPIPE,
			14 => Self::SIGALRM,
			15 => Self::SIGTERM,
			17 => Self::SIGCHLD,
			18 => Self::SIGCONT,
			19 => Self::SIGSTOP,
			20 => Self::SIGTSTP,
			21 => Self::SIGTTIN,
			22 => Self::SIGTTOU,
			23 => Self::SIGURG,
			26 => Self::SIGVTALRM,
			27 => Self::SIGPROF,
			29 => Self::SIGPOLL,
			31 => Self::SIGSYS,
			_ => return Err(errno!(EINVAL)),
		})
	}
}

impl Signal {
	/// Returns the signal's number.
	pub const fn get_id(&self) -> u8 {
		match self {
			Self::SIGHUP => 1,
			Self::SIGINT => 2,
			Self::SIGQUIT => 3,
			Self::SIGILL => 4,
			Self::SIGTRAP => 5,
			Self::SIGABRT => 6,
			Self::SIGBUS => 7,
			Self::SIGFPE => 8,
			Self::SIGKILL => 9,
			Self::SIGUSR1 => 10,
			Self::SIGSEGV => 11,
			Self::SIGUSR2 => 12,
			Self::SIGPIPE => 13,
			Self::SIGALRM => 14,
			Self::SIGTERM => 15,
			Self::SIGCHLD => 17,
			Self::SIGCONT => 18,
			Self::SIGSTOP => 19,
			Self::SIGTSTP => 20,
			Self::SIGTTIN => 21,
			Self::SIGTTOU => 22,
			Self::SIGURG => 23,
			Self::SIGVTALRM => 26,
			Self::SIGPROF => 27,
			Self::SIGPOLL => 29,
			Self::SIGSYS => 31,
		}
	}

	/// Returns the default disposition applied when a process has not installed its own handler.
	pub const fn default_action(&self) -> SignalAction {
		match self {
			Self::SIGHUP
			| Self::SIGINT
			| Self::SIGUSR1
			| Self::SIGUSR2
			| Self::SIGPIPE
			| Self::SIGALRM
			| Self::SIGTERM
			| Self::SIGVTALRM
			| Self::SIGPROF
			| Self::SIGPOLL
			| Self::SIGKILL
			| Self::SIGQUIT
			| Self::SIGILL
			| Self::SIGTRAP
			| Self::SIGABRT
			| Self::SIGBUS
			| Self::SIGFPE
			| Self::SIGSEGV
			| Self::SIGSYS => SignalAction::Terminate,
			Self::SIGSTOP | Self::SIGTSTP | Self::SIGTTIN | Self::SIGTTOU => SignalAction::Stop,
			Self::SIGCONT => SignalAction::Continue,
			Self::SIGCHLD | Self::SIGURG => SignalAction::Ignore,
		}
	}

	/// Tells whether a process may install a custom handler or ignore the signal.
	///
	/// `SIGKILL` and `SIGSTOP` always apply their default action.
	pub const fn can_catch(&self) -> bool {
		!matches!(self, Self::SIGKILL | Self::SIGSTOP)
	}
}

/// A process's disposition for a given signal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalAction {
	/// Apply [`Signal::default_action`].
	Default,
	/// Do nothing.
	Ignore,
	/// Terminate the process.
	Terminate,
	/// Stop the process.
	Stop,
	/// Resume a stopped process.
	Continue,
	/// Invoke the user handler at this address.
	User(usize),
}

impl Default for SignalAction {
	fn default() -> Self {
		Self::Default
	}
}

/// Per-process signal disposition table, indexed by [`Signal::get_id`].
#[derive(Clone)]
pub struct SignalHandlers([SignalAction; SIGNALS_COUNT]);

impl Default for SignalHandlers {
	fn default() -> Self {
		Self([SignalAction::Default; SIGNALS_COUNT])
	}
}

impl SignalHandlers {
	/// Returns the disposition installed for `signal`.
	pub fn get(&self, signal: &Signal) -> SignalAction {
		self.0[signal.get_id() as usize]
	}

	/// Installs `action` as the disposition for `signal`.
	///
	/// `SIGKILL` and `SIGSTOP` silently ignore installation attempts, matching `sigaction`'s
	/// `EINVAL` contract at the syscall boundary (handled by the caller, not here).
	pub fn set(&mut self, signal: &Signal, action: SignalAction) {
		if signal.can_catch() {
			self.0[signal.get_id() as usize] = action;
		}
	}

	/// Resolves the effective action to take for a pending `signal`: the installed disposition,
	/// or the signal's hard-coded default if uncatchable.
	pub fn resolve(&self, signal: &Signal) -> SignalAction {
		if !signal.can_catch() {
			return signal.default_action();
		}
		match self.get(signal) {
			SignalAction::Default => signal.default_action(),
			action => action,
		}
	}
}
