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

//! Physical and virtual memory management.
//!
//! This module handles every memory-related facility this core provides: the physical frame
//! allocator ([`buddy`]), the arbitrary-length page allocator built on it ([`pages`]), the small
//! object heap built on that ([`malloc`]), and the per-process virtual memory context
//! ([`vmem`]).
//!
//! The system's memory is divided in two ranges:
//! - Userspace: virtual memory below `PROCESS_END`, used by the currently running process.
//! - Kernelspace: virtual memory above `KERNEL_BEGIN`, used by the kernel itself and shared
//!   across processes (this is the 32-bit x86 3 GiB/1 GiB split; 64-bit addressing is out of
//!   scope).

use core::{
	fmt,
	mem::size_of,
	ops::{Add, Deref, DerefMut, Sub},
	ptr,
	ptr::NonNull,
};

pub mod buddy;
pub mod malloc;
pub mod pages;
#[cfg(feature = "memtrace")]
pub mod trace;
pub mod vmem;

/// Address of the beginning of the allocatable region in virtual memory.
pub const ALLOC_BEGIN: VirtAddr = VirtAddr(0x40000000);
/// Address of the end of the virtual memory reserved to a process (the 3 GiB mark).
pub const PROCESS_END: VirtAddr = VirtAddr(0xc0000000);
/// Address of the beginning of the kernelspace.
pub const KERNEL_BEGIN: VirtAddr = PROCESS_END;
/// The size of the kernelspace virtual memory in bytes.
pub const KERNELSPACE_SIZE: usize = usize::MAX - KERNEL_BEGIN.0 + 1;

/// The size of a page frame (4 KiB on this target).
pub use utils::limits::PAGE_SIZE;

/// An address on physical memory.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
	/// Converts the kernel physical address to a virtual address.
	///
	/// If the address is outside the kernelspace, the function returns `None`.
	pub fn kernel_to_virtual(self) -> Option<VirtAddr> {
		self.0.checked_add(KERNEL_BEGIN.0).map(VirtAddr)
	}
}

/// An address on virtual memory.
///
/// This would usually be represented by a pointer. However, in some cases we need to be able to
/// represent virtual addresses without having to dereference them.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(pub usize);

impl<T> From<*const T> for VirtAddr {
	fn from(ptr: *const T) -> Self {
		Self(ptr as usize)
	}
}

impl<T> From<*mut T> for VirtAddr {
	fn from(ptr: *mut T) -> Self {
		Self(ptr as usize)
	}
}

impl<T> From<NonNull<T>> for VirtAddr {
	fn from(ptr: NonNull<T>) -> Self {
		Self(ptr.as_ptr() as usize)
	}
}

impl VirtAddr {
	/// Converts the kernel virtual address to a physical address.
	///
	/// If the address is outside the kernelspace, the function returns `None`.
	pub fn kernel_to_physical(self) -> Option<PhysAddr> {
		self.0.checked_sub(KERNEL_BEGIN.0).map(PhysAddr)
	}

	/// Returns a mutable pointer to the virtual address.
	///
	/// Underneath, this function uses [`ptr::with_exposed_provenance_mut`].
	pub fn as_ptr<T>(self) -> *mut T {
		ptr::with_exposed_provenance_mut(self.0)
	}
}

macro_rules! addr_impl {
	($name:ident) => {
		impl $name {
			/// Tells whether the pointer is null.
			pub fn is_null(self) -> bool {
				self.0 == 0
			}

			/// Tells whether the pointer is aligned to `align`.
			pub fn is_aligned_to(self, align: usize) -> bool {
				self.0 % align == 0
			}

			/// Computes and returns the next address to be aligned to `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn align_to(self, align: usize) -> Self {
				Self(self.0.next_multiple_of(align))
			}

			/// Computes and returns the previous address to be aligned to `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn down_align_to(self, align: usize) -> Self {
				Self(self.0 & !(align - 1))
			}
		}

		impl Deref for $name {
			type Target = usize;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}

		impl DerefMut for $name {
			fn deref_mut(&mut self) -> &mut Self::Target {
				&mut self.0
			}
		}

		impl Add<usize> for $name {
			type Output = Self;

			/// Adds the given offset in bytes, wrapping on overflow.
			fn add(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_add(off))
			}
		}

		impl Sub<usize> for $name {
			type Output = Self;

			/// Subtracts the given offset in bytes, wrapping on overflow.
			fn sub(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_sub(off))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
				const LEN: usize = size_of::<usize>() * 2;
				write!(fmt, "{:0LEN$x}", self.0)
			}
		}
	};
}

addr_impl!(PhysAddr);
addr_impl!(VirtAddr);
