//! Mutually exclusive access primitive based on a spinlock.
//!
//! A [`Spin`] protects its wrapped data from being accessed concurrently, avoiding data races.
//!
//! One particularity of kernel development is that multi-threading is not the only source of
//! concurrency: an interrupt may fire at any moment. For this reason spinlocks here carry a
//! const parameter telling whether maskable interrupts stay enabled while the lock is held.

use core::{
	cell::UnsafeCell,
	fmt::{self, Formatter},
	hint,
	ops::{Deref, DerefMut},
	sync::atomic::{
		AtomicBool,
		Ordering::{Acquire, Release},
	},
};

#[cfg(target_arch = "x86")]
#[inline(always)]
fn is_interrupt_enabled() -> bool {
	let flags: usize;
	unsafe {
		core::arch::asm!("pushfd", "pop {}", out(reg) flags);
	}
	flags & 0x200 != 0
}

#[cfg(target_arch = "x86")]
#[inline(always)]
fn cli() {
	unsafe { core::arch::asm!("cli") };
}

#[cfg(target_arch = "x86")]
#[inline(always)]
fn sti() {
	unsafe { core::arch::asm!("sti") };
}

// Host builds (unit tests run on the development machine, not under the kernel) have no
// privilege to mask interrupts and no interrupts to mask; the `INT = false` path degrades to a
// plain spinlock there.
#[cfg(not(target_arch = "x86"))]
#[inline(always)]
fn is_interrupt_enabled() -> bool {
	false
}

#[cfg(not(target_arch = "x86"))]
#[inline(always)]
fn cli() {}

#[cfg(not(target_arch = "x86"))]
#[inline(always)]
fn sti() {}

#[inline(always)]
fn spin_acquire(lock: &AtomicBool) {
	while lock.swap(true, Acquire) {
		hint::spin_loop();
	}
}

/// Unlocks the associated [`Spin`] when dropped.
pub struct SpinGuard<'m, T: ?Sized, const INT: bool> {
	spin: &'m Spin<T, INT>,
	/// The interrupt status before locking. Relevant only when `INT == false`.
	int_state: bool,
}

impl<T: ?Sized, const INT: bool> Deref for SpinGuard<'_, T, INT> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		unsafe { &*self.spin.data.get() }
	}
}

impl<T: ?Sized, const INT: bool> DerefMut for SpinGuard<'_, T, INT> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		unsafe { &mut *self.spin.data.get() }
	}
}

impl<T: ?Sized, const INT: bool> !Send for SpinGuard<'_, T, INT> {}

unsafe impl<T: ?Sized + Sync, const INT: bool> Sync for SpinGuard<'_, T, INT> {}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for SpinGuard<'_, T, INT> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

impl<T: ?Sized, const INT: bool> Drop for SpinGuard<'_, T, INT> {
	fn drop(&mut self) {
		unsafe {
			self.spin.unlock(self.int_state);
		}
	}
}

/// Wraps a value which can be accessed by only one context at a time.
///
/// The `INT` generic parameter tells whether interrupts stay enabled while locked. Default is
/// `true`. Set it to `false` to mask interrupts for the lock's lifetime (required for anything
/// touched by an interrupt handler, to avoid deadlocking against itself).
pub struct Spin<T: ?Sized, const INT: bool = true> {
	spin: AtomicBool,
	data: UnsafeCell<T>,
}

impl<T, const INT: bool> Spin<T, INT> {
	/// Creates a new instance wrapping `data`.
	pub const fn new(data: T) -> Self {
		Self {
			spin: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: Default, const INT: bool> Default for Spin<T, INT> {
	fn default() -> Self {
		Self::new(Default::default())
	}
}

impl<T: ?Sized, const INT: bool> Spin<T, INT> {
	/// Acquires the spinlock, spinning until it becomes available.
	pub fn lock(&self) -> SpinGuard<T, INT> {
		let int_state = if !INT {
			let enabled = is_interrupt_enabled();
			cli();
			enabled
		} else {
			false
		};
		spin_acquire(&self.spin);
		SpinGuard {
			spin: self,
			int_state,
		}
	}

	/// Releases the spinlock. Called automatically when the guard is dropped; not meant to be
	/// called directly.
	///
	/// # Safety
	///
	/// The caller must currently hold the lock.
	pub unsafe fn unlock(&self, int_state: bool) {
		self.spin.store(false, Release);
		if !INT && int_state {
			sti();
		}
	}
}

impl<T, const INT: bool> Spin<T, INT> {
	/// Acquires the spinlock, consumes it and returns the inner value.
	pub fn into_inner(self) -> T {
		spin_acquire(&self.spin);
		self.data.into_inner()
	}
}

unsafe impl<T, const INT: bool> Sync for Spin<T, INT> {}

impl<T: ?Sized + fmt::Debug, const INT: bool> fmt::Debug for Spin<T, INT> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let guard = self.lock();
		fmt::Debug::fmt(&*guard, f)
	}
}

/// A spinlock which masks interrupts while held.
pub type IntSpin<T> = Spin<T, false>;
/// Guard for [`IntSpin`].
pub type IntSpinGuard<'m, T> = SpinGuard<'m, T, false>;
/// Alias kept for call sites that spell it `IntMutex` — it is the same primitive, it is simply
/// the one in near-universal use across the kernel (almost everything that needs mutual
/// exclusion also needs to keep an interrupt handler from re-entering it).
pub type IntMutex<T> = IntSpin<T>;
/// Guard for [`IntMutex`].
pub type IntMutexGuard<'m, T> = IntSpinGuard<'m, T>;

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn lock_unlock() {
		let s = Spin::<_, true>::new(0);
		{
			let mut g = s.lock();
			*g += 1;
		}
		assert_eq!(*s.lock(), 1);
	}

	#[test]
	fn int_mutex_roundtrip() {
		let m = IntMutex::new(vec![1, 2, 3]);
		m.lock().push(4);
		assert_eq!(*m.lock(), vec![1, 2, 3, 4]);
	}
}
