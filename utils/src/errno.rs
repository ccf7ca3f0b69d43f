//! Error codes returned across the kernel/user boundary, and the two `Result` aliases built on
//! top of them.
//!
//! Allocators only ever fail one way (out of memory), so their paths use [`AllocResult`] rather
//! than the full [`Errno`] space; everything else uses [`EResult`].

use core::fmt;

/// POSIX-flavored error codes.
///
/// Only the subset actually produced by this core is listed; the numeric values follow the
/// usual Linux/x86 errno numbering so that `-(errno as i32)` is the value handed back to a
/// syscall caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
	/// Operation not permitted.
	EPERM = 1,
	/// No such process.
	ESRCH = 3,
	/// Interrupted system call.
	EINTR = 4,
	/// I/O error.
	EIO = 5,
	/// Bad file descriptor.
	EBADF = 9,
	/// No child processes.
	ECHILD = 10,
	/// Try again.
	EAGAIN = 11,
	/// Out of memory.
	ENOMEM = 12,
	/// Bad address.
	EFAULT = 14,
	/// Invalid argument.
	EINVAL = 22,
	/// Function not implemented.
	ENOSYS = 38,
	/// Bad system call.
	ESYS = 88,
}

impl Errno {
	/// Returns the negated numeric value, as returned to a syscall caller in EAX.
	pub const fn as_negated(self) -> i32 {
		-(self as i32)
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::EPERM => "Operation not permitted",
			Self::ESRCH => "No such process",
			Self::EINTR => "Interrupted system call",
			Self::EIO => "I/O error",
			Self::EBADF => "Bad file descriptor",
			Self::ECHILD => "No child processes",
			Self::EAGAIN => "Try again",
			Self::ENOMEM => "Out of memory",
			Self::EFAULT => "Bad address",
			Self::EINVAL => "Invalid argument",
			Self::ENOSYS => "Function not implemented",
			Self::ESYS => "Bad system call",
		};
		write!(f, "{s}")
	}
}

/// Builds an [`Errno`] value. Exists mainly so call sites read the same whether the variant
/// needs arguments or not, matching the macro-based construction used throughout the reference
/// tree's call sites (`errno!(EINVAL)`).
#[macro_export]
macro_rules! errno {
	($variant:ident) => {
		$crate::errno::Errno::$variant
	};
}

/// The error returned by an allocator: there is exactly one way for `alloc`/`pages_alloc`/
/// `kmalloc` to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "out of memory")
	}
}

impl From<AllocError> for Errno {
	fn from(_: AllocError) -> Self {
		Errno::ENOMEM
	}
}

/// Result type for allocator-path operations (buddy, pages, kmalloc).
pub type AllocResult<T> = Result<T, AllocError>;

/// Result type for everything else (process, signal, mem_space, syscalls).
pub type EResult<T> = Result<T, Errno>;
