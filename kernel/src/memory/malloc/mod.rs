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

//! The small/medium/large object heap ("kmalloc"), layered on top of [`super::pages`].
//!
//! Requests are grouped into three size classes, each handled differently:
//! - Small (`< 512` bytes) and Medium (`< 256 KiB`) requests are served from fixed-size blocks
//!   (respectively [`block::SMALL_BLOCK_PAGES`] and [`block::MEDIUM_BLOCK_PAGES`] pages) carved
//!   into [`chunk::Chunk`]s, tracked by size-bucketed free lists ([`chunk::FreeListBins`]).
//! - Large requests get a standalone block sized to fit exactly, with a single chunk that is
//!   never split, merged or put in a free list: the block is returned to the pages allocator the
//!   moment it is freed.
//!
//! This module also backs the crate's `#[global_allocator]`, so the rest of the core can freely
//! use `alloc::vec::Vec`, `alloc::collections::BTreeMap` and friends.

mod block;
mod chunk;

use block::Block;
use chunk::{Chunk, FreeChunk, FreeListBins};
use core::{
	alloc::{GlobalAlloc, Layout},
	cmp::Ordering,
	ffi::c_void,
	num::NonZeroUsize,
	ptr,
	ptr::NonNull,
};
use macros::instrument_allocator;
use utils::{
	errno::{AllocError, AllocResult},
	lock::IntMutex,
};

/// The number of buckets tracking small chunks (`[8*2^i, 8*2^(i+1))` for `i` in `0..6`).
const SMALL_BINS: usize = 6;
/// The payload size, in bytes, of the smallest small-class bucket.
const SMALL_SMALLEST: usize = 8;
/// The number of buckets tracking medium chunks (`[512*2^i, 512*2^(i+1))`, capped at 256 KiB).
const MEDIUM_BINS: usize = 10;
/// The payload size, in bytes, of the smallest medium-class bucket.
const MEDIUM_SMALLEST: usize = 512;

/// The size class a request falls into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SizeClass {
	Small,
	Medium,
	Large,
}

impl SizeClass {
	/// The boundary, in bytes, under which a request is small.
	const SMALL_MAX: usize = MEDIUM_SMALLEST;
	/// The boundary, in bytes, under which a request is medium rather than large.
	const MEDIUM_MAX: usize = 256 * 1024;

	/// Classifies a request of `size` payload bytes.
	fn of(size: usize) -> Self {
		if size < Self::SMALL_MAX {
			Self::Small
		} else if size < Self::MEDIUM_MAX {
			Self::Medium
		} else {
			Self::Large
		}
	}

	/// Classifies the block backing `block`, by its page count. Returns `None` for a large,
	/// single-chunk block, which has no free-list bucket.
	fn of_block(block: &Block) -> Option<Self> {
		match block.pages_count() {
			block::SMALL_BLOCK_PAGES => Some(Self::Small),
			block::MEDIUM_BLOCK_PAGES => Some(Self::Medium),
			_ => None,
		}
	}
}

/// The heap's free-list state, protected by a single global spinlock.
struct Heap {
	small: [Option<NonNull<FreeChunk>>; SMALL_BINS],
	medium: [Option<NonNull<FreeChunk>>; MEDIUM_BINS],
}

impl Heap {
	/// Returns the free-list bins for `class`. Panics if called with [`SizeClass::Large`].
	fn bins(&mut self, class: SizeClass) -> FreeListBins<'_> {
		match class {
			SizeClass::Small => FreeListBins::new(&mut self.small, SMALL_SMALLEST),
			SizeClass::Medium => FreeListBins::new(&mut self.medium, MEDIUM_SMALLEST),
			SizeClass::Large => unreachable!("the large class has no free-list bucket"),
		}
	}
}

/// The allocator's global spinlock.
static HEAP: IntMutex<Heap> = IntMutex::new(Heap {
	small: [None; SMALL_BINS],
	medium: [None; MEDIUM_BINS],
});

/// Walks up a block's sibling chain to find the block owning `chunk`.
unsafe fn owning_block(chunk: &mut Chunk) -> &'static mut Block {
	let mut first: *mut Chunk = chunk;
	while let Some(prev) = (*first).get_prev() {
		first = prev;
	}
	Block::from_first_chunk(first)
}

/// Finds or carves a chunk with at least `size` payload bytes for `class`, marks it used and
/// returns it.
fn get_chunk(heap: &mut Heap, class: SizeClass, size: usize) -> AllocResult<NonNull<Chunk>> {
	if class == SizeClass::Large {
		let block = Block::new_large(size)?;
		return Ok(NonNull::from(&mut block.first_chunk));
	}
	let block_pages = match class {
		SizeClass::Small => block::SMALL_BLOCK_PAGES,
		SizeClass::Medium => block::MEDIUM_BLOCK_PAGES,
		SizeClass::Large => unreachable!(),
	};
	let mut bins = heap.bins(class);
	let mut fc = match bins.find(size) {
		Some(fc) => {
			bins.remove(fc);
			fc
		}
		None => {
			let block = Block::new(block_pages)?;
			NonNull::from(block.first_chunk.as_free_chunk().unwrap())
		}
	};
	let chunk = unsafe { &mut fc.as_mut().chunk };
	if let Some(remainder) = chunk.split(size) {
		bins.insert(NonNull::from(remainder));
	}
	Ok(NonNull::from(chunk))
}

#[instrument_allocator(name = kmalloc, op = alloc, size = n, scale = linear)]
unsafe fn alloc(n: NonZeroUsize) -> AllocResult<NonNull<c_void>> {
	let size = n.get();
	let class = SizeClass::of(size);
	let mut heap = HEAP.lock();
	let mut chunk = get_chunk(&mut heap, class, size)?;
	let chunk = chunk.as_mut();
	chunk.used = true;
	let ptr = chunk.ptr();
	debug_assert!(ptr.as_ptr().is_aligned_to(chunk::ALIGNMENT));
	Ok(ptr.cast())
}

#[instrument_allocator(name = kmalloc, op = realloc, ptr = ptr, size = n, scale = linear)]
unsafe fn realloc(ptr: NonNull<c_void>, n: NonZeroUsize) -> AllocResult<NonNull<c_void>> {
	let new_size = n.get();
	let ptr = ptr.cast::<u8>();
	let chunk = Chunk::from_ptr(ptr.as_ptr());
	assert!(chunk.used);
	let block = owning_block(chunk);
	let old_size = chunk.get_size();
	let same_class = SizeClass::of_block(block).is_some_and(|c| SizeClass::of(new_size) == c);
	match new_size.cmp(&old_size) {
		Ordering::Equal => Ok(ptr.cast()),
		Ordering::Less if same_class => {
			let mut heap = HEAP.lock();
			let class = SizeClass::of_block(block).unwrap();
			let mut bins = heap.bins(class);
			if let Some(remainder) = chunk.split(new_size) {
				bins.insert(NonNull::from(remainder));
			}
			Ok(ptr.cast())
		}
		Ordering::Greater if same_class => {
			let mut heap = HEAP.lock();
			let class = SizeClass::of_block(block).unwrap();
			let mut bins = heap.bins(class);
			match chunk.try_grow(new_size - old_size) {
				Some(absorbed) => {
					bins.remove(absorbed);
					if let Some(remainder) = chunk.split(new_size) {
						bins.insert(NonNull::from(remainder));
					}
					Ok(ptr.cast())
				}
				None => {
					drop(heap);
					let new_ptr = alloc(n)?.cast::<u8>();
					ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
					free(ptr.cast());
					Ok(new_ptr.cast())
				}
			}
		}
		_ => {
			let new_ptr = alloc(n)?.cast::<u8>();
			ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
			free(ptr.cast());
			Ok(new_ptr.cast())
		}
	}
}

#[instrument_allocator(name = kmalloc, op = free, ptr = ptr)]
unsafe fn free(ptr: NonNull<c_void>) {
	let mut ptr = ptr.cast::<u8>();
	let chunk = Chunk::from_ptr(ptr.as_mut());
	assert!(chunk.used);
	chunk.used = false;
	let block = owning_block(chunk);
	let Some(class) = SizeClass::of_block(block) else {
		// Large class: a single chunk occupies the whole block.
		ptr::drop_in_place(block as *mut Block);
		return;
	};
	let mut heap = HEAP.lock();
	let mut bins = heap.bins(class);
	if let Some(next) = chunk.get_next() {
		if !next.used {
			bins.remove(NonNull::from(next.as_free_chunk().unwrap()));
			chunk.merge_with_next();
		}
	}
	let chunk = match chunk.get_prev() {
		Some(prev) if !prev.used => {
			bins.remove(NonNull::from(prev.as_free_chunk().unwrap()));
			prev.merge_with_next();
			prev
		}
		_ => chunk,
	};
	if chunk.is_single() {
		drop(bins);
		drop(heap);
		let block = owning_block(chunk);
		ptr::drop_in_place(block as *mut Block);
	} else {
		bins.insert(NonNull::from(chunk.as_free_chunk().unwrap()));
	}
}

/// Allocates `size` bytes of uninitialized kernel memory, returning a null-free-on-error handle.
pub fn kmalloc(size: usize) -> AllocResult<NonNull<u8>> {
	let n = NonZeroUsize::new(size).ok_or(AllocError)?;
	unsafe { alloc(n) }.map(NonNull::cast)
}

/// Like [`kmalloc`], but the returned memory is zeroed.
pub fn kmalloc_zero(size: usize) -> AllocResult<NonNull<u8>> {
	let ptr = kmalloc(size)?;
	unsafe {
		ptr::write_bytes(ptr.as_ptr(), 0, size);
	}
	Ok(ptr)
}

/// Resizes the allocation at `ptr` (previously obtained from [`kmalloc`]) to `size` bytes,
/// preserving data up to `min(old_size, size)`.
///
/// # Safety
///
/// `ptr` must point to a live allocation returned by this module.
pub unsafe fn krealloc(ptr: NonNull<u8>, size: usize) -> AllocResult<NonNull<u8>> {
	let n = NonZeroUsize::new(size).ok_or(AllocError)?;
	realloc(ptr.cast(), n).map(NonNull::cast)
}

/// Frees the allocation at `ptr`, previously obtained from [`kmalloc`].
///
/// # Safety
///
/// `ptr` must point to a live allocation returned by this module, and must not be used again
/// afterwards.
pub unsafe fn kfree(ptr: NonNull<u8>) {
	free(ptr.cast());
}

/// Backs `alloc::vec::Vec`, `alloc::collections::BTreeMap` and the rest of `extern crate alloc`
/// for the core.
struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		kmalloc(layout.size())
			.map(|p| p.as_ptr())
			.unwrap_or(ptr::null_mut())
	}

	unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
		if let Some(ptr) = NonNull::new(ptr) {
			kfree(ptr);
		}
	}

	unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
		let Some(ptr) = NonNull::new(ptr) else {
			return self.alloc(Layout::from_size_align_unchecked(new_size, 1));
		};
		krealloc(ptr, new_size)
			.map(|p| p.as_ptr())
			.unwrap_or(ptr::null_mut())
	}
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::buddy;
	use core::slice;
	use utils::{limits::PAGE_SIZE, math};

	#[test_case]
	fn alloc_free_tiny() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = kmalloc(1).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), 1).fill(!0);
			kfree(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_free_small() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = kmalloc(8).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), 8).fill(!0);
			kfree(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_free_medium() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = kmalloc(PAGE_SIZE).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), PAGE_SIZE).fill(!0);
			kfree(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_free_large() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = kmalloc(PAGE_SIZE * 100).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), PAGE_SIZE * 100).fill(!0);
			kfree(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_zeroed() {
		let ptr = kmalloc_zero(128).unwrap();
		unsafe {
			let data = slice::from_raw_parts(ptr.as_ptr(), 128);
			assert!(data.iter().all(|b| *b == 0));
			kfree(ptr);
		}
	}

	#[test_case]
	fn alloc_free_fifo() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptrs: [NonNull<u8>; 256] = [NonNull::dangling(); 256];
			for (i, p) in ptrs.iter_mut().enumerate() {
				let size = i + 1;
				let ptr = kmalloc(size).unwrap();
				slice::from_raw_parts_mut(ptr.as_ptr(), size).fill(!0);
				*p = ptr;
			}
			for i in 0..ptrs.len() {
				for j in (i + 1)..ptrs.len() {
					assert_ne!(ptrs[j], ptrs[i]);
				}
			}
			for p in ptrs {
				kfree(p);
			}
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	fn lifo_test(i: usize) {
		unsafe {
			let ptr = kmalloc(i).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), i).fill(!0);
			if i > 1 {
				lifo_test(i - 1);
			}
			kfree(ptr);
		}
	}

	#[test_case]
	fn alloc_free_lifo() {
		let usage = buddy::allocated_pages_count();
		lifo_test(100);
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn realloc_grow() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptr = kmalloc(1).unwrap();
			for i in 1..256 {
				ptr = krealloc(ptr, i).unwrap();
				slice::from_raw_parts_mut(ptr.as_ptr(), i).fill(!0);
			}
			kfree(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn realloc_shrink() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptr = kmalloc(256).unwrap();
			for i in (1..256).rev() {
				ptr = krealloc(ptr, i).unwrap();
				slice::from_raw_parts_mut(ptr.as_ptr(), i).fill(!0);
			}
			kfree(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn realloc_cross_class() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptr = kmalloc(8).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), 8).fill(!0);
			ptr = krealloc(ptr, PAGE_SIZE * 10).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), PAGE_SIZE * 10).fill(!0);
			ptr = krealloc(ptr, 4).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), 4).fill(!0);
			kfree(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	/// Repeats `kmalloc(1000)` until the heap is exhausted, checking every returned pointer is
	/// 16-byte-aligned and distinct from every other (via a Floyd cycle check on a linked list
	/// threaded through the allocations themselves, so the check itself never allocates), then
	/// frees them all.
	#[test_case]
	fn bulk_kmalloc_until_exhausted() {
		let usage = buddy::allocated_pages_count();
		struct Node {
			next: Option<NonNull<Node>>,
		}
		unsafe fn has_cycle(begin: NonNull<Node>) -> bool {
			let mut tortoise = Some(begin);
			let mut hoare = (*begin.as_ptr()).next;
			while let (Some(t), Some(h)) = (tortoise, hoare) {
				if t.as_ptr() == h.as_ptr() {
					return true;
				}
				tortoise = (*t.as_ptr()).next;
				hoare = (*h.as_ptr()).next.and_then(|h| (*h.as_ptr()).next);
			}
			false
		}
		unsafe {
			let mut first: Option<NonNull<Node>> = None;
			while let Ok(ptr) = kmalloc(1000) {
				assert!(ptr.as_ptr().is_aligned_to(16));
				let mut node = ptr.cast::<Node>();
				node.as_mut().next = first;
				first = Some(node);
			}
			assert!(!has_cycle(first.unwrap()));
			while let Some(node) = first {
				let next = (*node.as_ptr()).next;
				kfree(node.cast());
				first = next;
			}
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn realloc_two_chunks() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptr0 = kmalloc(8).unwrap();
			slice::from_raw_parts_mut(ptr0.as_ptr(), 8).fill(!0);
			let mut ptr1 = kmalloc(8).unwrap();
			slice::from_raw_parts_mut(ptr1.as_ptr(), 8).fill(!0);
			for i in 0..8 {
				ptr0 = krealloc(ptr0, math::pow2(i)).unwrap();
				ptr1 = krealloc(ptr1, math::pow2(i) + 1).unwrap();
			}
			kfree(ptr1);
			kfree(ptr0);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}
}
