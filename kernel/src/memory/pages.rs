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

//! The pages allocator satisfies requests for an arbitrary number of contiguous pages, carving
//! them out of blocks obtained from the [`buddy`] allocator.
//!
//! A backing buddy block is split into [`PagesBlock`] descriptors: one per live used or free
//! sub-region. Free descriptors are indexed by a size bucket (bucket `i` holds blocks whose page
//! count lies in `[2^i, 2^(i+1))`); used descriptors are indexed by a pointer-keyed hash chain so
//! [`pages_free`] can locate them in roughly constant time.
//!
//! Descriptors themselves are never heap-allocated: this module backs [`super::malloc`], so it
//! must not depend on it. They are drawn from a fixed-capacity pool instead, the same way
//! [`buddy::Frame`] metadata lives outside the memory it describes.

use crate::memory::buddy::{self, ZoneKind};
use core::{ffi::c_void, ptr::NonNull};
use utils::{
	errno::{AllocError, AllocResult},
	lock::IntMutex,
	list::{Link, Linked, List},
	math,
};

/// The number of free-list size buckets. Bucket `i` holds blocks of `[2^i, 2^(i+1))` pages.
const FREE_BUCKETS: usize = buddy::MAX_ORDER as usize + 1;
/// The number of chains in the used-block hash table.
const HASH_BUCKETS: usize = 256;
/// The number of descriptors available at once. Exhausting this pool fails an allocation the
/// same way exhausting the buddy allocator does.
const POOL_CAPACITY: usize = 8192;

/// A live sub-region of a buddy-backed block: either handed out to a caller, or sitting free in
/// a size bucket waiting to be reused.
struct PagesBlock {
	/// The page-aligned pointer to the beginning of the region this descriptor covers.
	ptr: *mut c_void,
	/// The number of pages this descriptor covers.
	pages: usize,
	/// Whether the region is currently handed out.
	used: bool,
	/// The order of the buddy block this descriptor (and its siblings) were carved from.
	buddy_order: buddy::FrameOrder,
	/// The previous descriptor within the same buddy block, in address order.
	buddy_prev: Option<NonNull<PagesBlock>>,
	/// The next descriptor within the same buddy block, in address order.
	buddy_next: Option<NonNull<PagesBlock>>,
	/// Link into either the owning free bucket or the used hash chain (never both at once).
	link: Link<PagesBlock>,
}

unsafe impl Linked for PagesBlock {
	fn link(&self) -> &Link<Self> {
		&self.link
	}
}

impl PagesBlock {
	fn bucket(&self) -> usize {
		bucket_for(self.pages)
	}
}

fn bucket_for(pages: usize) -> usize {
	math::log2(pages).min(FREE_BUCKETS as u32 - 1) as usize
}

fn hash_bucket(ptr: *const c_void) -> usize {
	((ptr as usize) / crate::memory::PAGE_SIZE) % HASH_BUCKETS
}

/// A fixed-capacity pool of [`PagesBlock`] descriptors, handed out and reclaimed through a
/// simple index freelist.
struct DescriptorPool {
	slots: [PagesBlock; POOL_CAPACITY],
	/// Stack of indices into `slots` that are not currently in use.
	free: [u16; POOL_CAPACITY],
	free_len: usize,
}

const UNINIT_BLOCK: PagesBlock = PagesBlock {
	ptr: core::ptr::null_mut(),
	pages: 0,
	used: false,
	buddy_order: 0,
	buddy_prev: None,
	buddy_next: None,
	link: Link::new(),
};

static POOL: IntMutex<DescriptorPool> = IntMutex::new(DescriptorPool {
	slots: [UNINIT_BLOCK; POOL_CAPACITY],
	free: {
		let mut f = [0u16; POOL_CAPACITY];
		let mut i = 0;
		while i < POOL_CAPACITY {
			f[i] = i as u16;
			i += 1;
		}
		f
	},
	free_len: POOL_CAPACITY,
});

/// State shared by all pages-allocator operations.
struct State {
	free_buckets: [List<PagesBlock>; FREE_BUCKETS],
	used_hash: [List<PagesBlock>; HASH_BUCKETS],
}

static STATE: IntMutex<State> = IntMutex::new(State {
	free_buckets: [const { List::new() }; FREE_BUCKETS],
	used_hash: [const { List::new() }; HASH_BUCKETS],
});

fn alloc_descriptor() -> AllocResult<NonNull<PagesBlock>> {
	let mut pool = POOL.lock();
	if pool.free_len == 0 {
		return Err(AllocError);
	}
	pool.free_len -= 1;
	let idx = pool.free[pool.free_len] as usize;
	Ok(NonNull::from(&mut pool.slots[idx]))
}

fn free_descriptor(desc: NonNull<PagesBlock>) {
	let mut pool = POOL.lock();
	let base = pool.slots.as_ptr();
	let idx = unsafe { desc.as_ptr().offset_from(base) } as usize;
	let free_len = pool.free_len;
	pool.free[free_len] = idx as u16;
	pool.free_len += 1;
}

/// Allocates `n` contiguous pages of kernel-zone memory.
///
/// On success, returns a page-aligned *virtual* pointer to the first page.
pub fn pages_alloc(n: usize) -> AllocResult<NonNull<c_void>> {
	assert!(n > 0);
	let mut state = STATE.lock();
	// Try to serve the request from an existing free descriptor.
	let start = bucket_for(n);
	let found = state.free_buckets[start]
		.iter()
		.find(|node| unsafe { node.as_ref().pages } >= n)
		.or_else(|| {
			state.free_buckets[(start + 1)..]
				.iter()
				.find_map(|b| b.front())
		});
	if let Some(mut node) = found {
		let bucket = unsafe { node.as_ref().bucket() };
		unsafe {
			state.free_buckets[bucket].remove(node);
		}
		let block = unsafe { node.as_mut() };
		let remainder = block.pages - n;
		let ptr = block.ptr;
		if remainder > 0 {
			let rem_desc = match alloc_descriptor() {
				Ok(d) => d,
				Err(e) => {
					block.pages = remainder + n;
					unsafe {
						state.free_buckets[block.bucket()].insert_front(node);
					}
					return Err(e);
				}
			};
			unsafe {
				let rem_ptr = ptr.byte_add(n * crate::memory::PAGE_SIZE);
				*rem_desc.as_ptr() = PagesBlock {
					ptr: rem_ptr,
					pages: remainder,
					used: false,
					buddy_order: block.buddy_order,
					buddy_prev: Some(node),
					buddy_next: block.buddy_next,
					link: Link::new(),
				};
				if let Some(mut next) = block.buddy_next {
					next.as_mut().buddy_prev = Some(rem_desc);
				}
				block.buddy_next = Some(rem_desc);
				let rem_bucket = (*rem_desc.as_ptr()).bucket();
				state.free_buckets[rem_bucket].insert_front(rem_desc);
			}
		}
		block.pages = n;
		block.used = true;
		unsafe {
			state.used_hash[hash_bucket(ptr)].insert_front(node);
		}
		return NonNull::new(ptr).ok_or(AllocError);
	}
	// No existing descriptor fits: pull a fresh block from the buddy allocator.
	let order = buddy::get_order(n);
	let total_pages = math::pow2(order as u32);
	let remainder = total_pages - n;
	let used_desc = alloc_descriptor()?;
	let rem_desc = if remainder > 0 {
		match alloc_descriptor() {
			Ok(d) => Some(d),
			Err(e) => {
				free_descriptor(used_desc);
				return Err(e);
			}
		}
	} else {
		None
	};
	let ptr = match buddy::alloc(order, ZoneKind::Kernel) {
		Ok(p) => p.as_ptr(),
		Err(e) => {
			free_descriptor(used_desc);
			if let Some(d) = rem_desc {
				free_descriptor(d);
			}
			return Err(e);
		}
	};
	unsafe {
		*used_desc.as_ptr() = PagesBlock {
			ptr,
			pages: n,
			used: true,
			buddy_order: order,
			buddy_prev: None,
			buddy_next: rem_desc,
			link: Link::new(),
		};
		if let Some(rd) = rem_desc {
			let rem_ptr = ptr.byte_add(n * crate::memory::PAGE_SIZE);
			*rd.as_ptr() = PagesBlock {
				ptr: rem_ptr,
				pages: remainder,
				used: false,
				buddy_order: order,
				buddy_prev: Some(used_desc),
				buddy_next: None,
				link: Link::new(),
			};
			let rem_bucket = (*rd.as_ptr()).bucket();
			state.free_buckets[rem_bucket].insert_front(rd);
		}
		state.used_hash[hash_bucket(ptr)].insert_front(used_desc);
	}
	NonNull::new(ptr).ok_or(AllocError)
}

/// Like [`pages_alloc`], but zeroes the returned memory.
pub fn pages_alloc_zero(n: usize) -> AllocResult<NonNull<c_void>> {
	let ptr = pages_alloc(n)?;
	unsafe {
		core::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0, n * crate::memory::PAGE_SIZE);
	}
	Ok(ptr)
}

/// Frees `n` pages previously returned by [`pages_alloc`].
///
/// # Panics
///
/// Panics if `ptr` was not returned by this allocator, or `n` does not match the size it was
/// allocated with: both indicate caller-side memory corruption that a normal `AllocResult` would
/// only paper over.
pub fn pages_free(ptr: NonNull<c_void>, n: usize) {
	let mut state = STATE.lock();
	let ptr = ptr.as_ptr();
	let mut desc = state.used_hash[hash_bucket(ptr)]
		.iter()
		.find(|node| unsafe { node.as_ref().ptr } == ptr)
		.expect("pages_free: pointer not allocated by this allocator");
	let block = unsafe { desc.as_mut() };
	assert_eq!(block.pages, n, "pages_free: size mismatch");
	unsafe {
		state.used_hash[hash_bucket(ptr)].remove(desc);
	}
	block.used = false;
	coalesce_and_release(&mut state, desc);
}

/// Tries to merge `desc` with its buddy-block siblings, freeing the whole buddy block back to
/// the frame allocator if it becomes a single free descriptor spanning it entirely.
fn coalesce_and_release(state: &mut State, mut desc: NonNull<PagesBlock>) {
	loop {
		let block = unsafe { desc.as_mut() };
		if let Some(mut next) = block.buddy_next {
			let next_ref = unsafe { next.as_mut() };
			if !next_ref.used {
				unsafe {
					state.free_buckets[next_ref.bucket()].remove(next);
				}
				block.pages += next_ref.pages;
				block.buddy_next = next_ref.buddy_next;
				if let Some(mut nn) = block.buddy_next {
					unsafe {
						nn.as_mut().buddy_prev = Some(desc);
					}
				}
				free_descriptor(next);
				continue;
			}
		}
		if let Some(mut prev) = block.buddy_prev {
			let prev_ref = unsafe { prev.as_mut() };
			if !prev_ref.used {
				unsafe {
					state.free_buckets[prev_ref.bucket()].remove(prev);
				}
				prev_ref.pages += block.pages;
				prev_ref.buddy_next = block.buddy_next;
				if let Some(mut nn) = prev_ref.buddy_next {
					unsafe {
						nn.as_mut().buddy_prev = Some(prev);
					}
				}
				free_descriptor(desc);
				desc = prev;
				continue;
			}
		}
		break;
	}
	let block = unsafe { desc.as_ref() };
	let spans_whole_block =
		block.buddy_prev.is_none() && block.buddy_next.is_none() && block.pages == math::pow2(block.buddy_order as u32);
	if spans_whole_block {
		let (ptr, order) = (block.ptr, block.buddy_order);
		free_descriptor(desc);
		unsafe {
			buddy::free(ptr, order);
		}
	} else {
		unsafe {
			state.free_buckets[block.bucket()].insert_front(desc);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test_case]
	fn pages_single_roundtrip() {
		let p = pages_alloc(3).unwrap();
		pages_free(p, 3);
	}

	#[test_case]
	fn pages_zeroed() {
		let p = pages_alloc_zero(2).unwrap();
		unsafe {
			let bytes = core::slice::from_raw_parts(p.as_ptr() as *const u8, 2 * crate::memory::PAGE_SIZE);
			assert!(bytes.iter().all(|&b| b == 0));
		}
		pages_free(p, 2);
	}

	#[test_case]
	fn pages_split_and_reuse() {
		let a = pages_alloc(1).unwrap();
		let b = pages_alloc(1).unwrap();
		assert_ne!(a, b);
		pages_free(a, 1);
		pages_free(b, 1);
	}

	#[test_case]
	fn pages_many_small() {
		let mut ptrs = [core::ptr::null_mut(); 32];
		for slot in ptrs.iter_mut() {
			*slot = pages_alloc(1).unwrap().as_ptr();
		}
		for i in 0..ptrs.len() {
			for j in (i + 1)..ptrs.len() {
				assert_ne!(ptrs[i], ptrs[j]);
			}
		}
		for &p in ptrs.iter() {
			pages_free(NonNull::new(p).unwrap(), 1);
		}
	}
}
