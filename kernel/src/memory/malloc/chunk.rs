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

//! In the small/medium heap, a chunk of memory is a subdivision of a [`super::block::Block`].
//!
//! It represents a portion of memory that might be available for allocation, or might already be
//! allocated. Chunks of the same block are linked to each other by a doubly-linked list, which
//! allows splitting and merging neighbors on alloc/free.
//!
//! Unlike the block it lives in, a chunk knows nothing about which size-class free list it
//! belongs to: callers (in [`super`]) pass the [`FreeListBins`] to operate on explicitly, since
//! small and medium blocks keep separate bucket sets.

use core::{
	cmp::max,
	mem::size_of,
	ptr,
	ptr::NonNull,
};

/// The magic number for every chunk, checked in debug builds.
#[cfg(config_debug_malloc_magic)]
const CHUNK_MAGIC: u32 = 0xdeadbeef;
/// The minimum amount of bytes required to create a free chunk.
const FREE_CHUNK_MIN: usize = 16;
/// The required alignment for pointers returned by the allocator.
pub const ALIGNMENT: usize = 16;
/// The size in bytes of a chunk's header.
pub const CHUNK_HDR_SIZE: usize = size_of::<Chunk>();

/// A chunk of allocated or free memory, stored in a block's sibling list.
#[repr(align(16))]
pub struct Chunk {
	/// The magic number used to check the chunk's integrity.
	#[cfg(config_debug_malloc_magic)]
	magic: u32,
	/// The previous chunk in the block.
	prev: Option<NonNull<Self>>,
	/// The next chunk in the block.
	next: Option<NonNull<Self>>,
	/// Whether the chunk is in use.
	pub used: bool,
	/// The size of the chunk's payload in bytes.
	size: usize,
}

impl Chunk {
	/// Creates a new, detached instance.
	pub fn new() -> Self {
		Self {
			#[cfg(config_debug_malloc_magic)]
			magic: CHUNK_MAGIC,
			prev: None,
			next: None,
			used: false,
			size: 0,
		}
	}

	/// Returns the chunk corresponding to the given payload pointer.
	pub unsafe fn from_ptr(ptr: *mut u8) -> &'static mut Self {
		&mut *(((ptr as usize) - size_of::<Self>()) as *mut Self)
	}

	/// Returns the previous chunk in the block's sibling list.
	#[inline]
	pub fn get_prev(&self) -> Option<&'static mut Self> {
		self.prev.map(|mut n| unsafe { n.as_mut() })
	}

	/// Returns the next chunk in the block's sibling list.
	#[inline]
	pub fn get_next(&self) -> Option<&'static mut Self> {
		self.next.map(|mut n| unsafe { n.as_mut() })
	}

	/// Tells whether the chunk has no siblings, i.e. it alone occupies its block.
	#[inline]
	pub fn is_single(&self) -> bool {
		self.prev.is_none() && self.next.is_none()
	}

	/// Inserts the current chunk after `chunk` in the sibling list.
	pub fn insert_after(&mut self, chunk: &mut Self) {
		debug_assert!((chunk as *const _ as usize) < (self as *const _ as usize));
		self.prev = NonNull::new(chunk);
		self.next = chunk.next;
		if let Some(next) = self.get_next() {
			next.prev = NonNull::new(self);
		}
		chunk.next = NonNull::new(self);
	}

	/// Unlinks the current chunk from its sibling list.
	pub fn unlink(&mut self) {
		if let Some(prev) = self.get_prev() {
			prev.next = self.next;
		}
		if let Some(next) = self.get_next() {
			next.prev = self.prev;
		}
		self.prev = None;
		self.next = None;
	}

	/// Returns a pointer to the chunk's payload.
	#[inline]
	pub fn ptr(&self) -> NonNull<u8> {
		unsafe { NonNull::new_unchecked((self as *const Self as *mut u8).add(size_of::<Self>())) }
	}

	/// Returns the size of the chunk's payload in bytes.
	#[inline]
	pub fn get_size(&self) -> usize {
		self.size
	}

	/// Checks the chunk's integrity. Only active in debug builds.
	#[cfg(config_debug_malloc_check)]
	pub fn check(&self) {
		#[cfg(config_debug_malloc_magic)]
		debug_assert_eq!(self.magic, CHUNK_MAGIC);
		debug_assert!(self.get_size() >= get_min_chunk_size());
		debug_assert!(self.ptr().as_ptr().is_aligned_to(ALIGNMENT));
	}

	/// Returns `self` as a [`FreeChunk`] if it is not in use.
	#[inline]
	pub fn as_free_chunk(&mut self) -> Option<&mut FreeChunk> {
		if !self.used {
			Some(unsafe { &mut *(self as *mut Self as *mut FreeChunk) })
		} else {
			None
		}
	}

	/// Returns the location a sibling chunk could start at to leave `size` payload bytes in
	/// `self`, if that leaves enough room for a minimal chunk after it.
	fn get_split_next_chunk(&mut self, size: usize) -> Option<&'static mut FreeChunk> {
		#[cfg(config_debug_malloc_check)]
		self.check();
		let min_data_size = get_min_chunk_size();
		let size = max(size, min_data_size);
		let raw = unsafe { self.ptr().as_ptr().add(size) } as usize;
		let next_ptr = raw.next_multiple_of(ALIGNMENT) as *mut FreeChunk;
		let new_size = (next_ptr as usize) - (self.ptr().as_ptr() as usize);
		debug_assert!(new_size >= size);
		if new_size + size_of::<Chunk>() + min_data_size <= self.size {
			Some(unsafe { &mut *(next_ptr as *mut FreeChunk) })
		} else {
			None
		}
	}

	/// Splits the chunk so that it keeps `size` payload bytes, if there is enough room left over
	/// for a sibling chunk.
	///
	/// The sibling chunk, if any, is linked into the sibling list but **not** inserted into a
	/// free-list bucket; the caller does that.
	pub fn split(&mut self, size: usize) -> Option<&'static mut FreeChunk> {
		let next = self.get_split_next_chunk(size)?;
		let new_size = (next as *mut _ as usize) - (self.ptr().as_ptr() as usize);
		let next_size = self.size - new_size - size_of::<Chunk>();
		unsafe {
			ptr::write_volatile(next, FreeChunk::new(next_size));
		}
		#[cfg(config_debug_malloc_check)]
		next.chunk.check();
		next.chunk.insert_after(self);
		self.size = new_size;
		#[cfg(config_debug_malloc_check)]
		self.check();
		Some(next)
	}

	/// Merges `self` with its next sibling, which must be free and detached from its free-list
	/// bucket already.
	pub fn merge_with_next(&mut self) {
		let next = self.get_next().expect("merge_with_next: no next chunk");
		debug_assert!(!next.used);
		next.unlink();
		self.size += size_of::<Chunk>() + next.size;
		#[cfg(config_debug_malloc_check)]
		self.check();
	}

	/// Tries to grow the chunk in place by `delta` bytes by fully absorbing its next sibling.
	///
	/// On success, the next sibling is unlinked from the sibling list and its handle is returned
	/// so the caller can remove it from its free-list bucket; the caller may then call
	/// [`Self::split`] on `self` to hand back any excess as a new free chunk. Returns `None` and
	/// leaves the chunk unmodified if the next sibling is absent, in use, or too small.
	pub fn try_grow(&mut self, delta: usize) -> Option<NonNull<FreeChunk>> {
		debug_assert!(self.used);
		let next = self.get_next()?;
		if next.used {
			return None;
		}
		let available = size_of::<Chunk>() + next.size;
		if available < delta {
			return None;
		}
		let handle = NonNull::from(next.as_free_chunk().expect("try_grow: next chunk in use"));
		next.unlink();
		self.size += available;
		Some(handle)
	}
}

impl Default for Chunk {
	fn default() -> Self {
		Self::new()
	}
}

/// A free chunk, wrapping [`Chunk`].
///
/// Layout must not be reordered: the free-list pointers live right after the chunk header so
/// that the chunk's own payload area doubles as free-list storage while it is unused.
#[repr(C, align(16))]
pub struct FreeChunk {
	/// The wrapped chunk.
	pub chunk: Chunk,
	/// The previous free chunk in its free-list bucket.
	pub prev: Option<NonNull<Self>>,
	/// The next free chunk in its free-list bucket.
	pub next: Option<NonNull<Self>>,
}

impl FreeChunk {
	/// Creates a new free chunk of `size` payload bytes. Not yet linked into any free-list
	/// bucket.
	pub fn new(size: usize) -> Self {
		Self {
			chunk: Chunk {
				#[cfg(config_debug_malloc_magic)]
				magic: CHUNK_MAGIC,
				prev: None,
				next: None,
				used: false,
				size,
			},
			prev: None,
			next: None,
		}
	}
}

/// Returns the minimum payload size for a chunk: large enough to later host [`FreeChunk`]'s own
/// free-list pointers when the chunk becomes free.
pub const fn get_min_chunk_size() -> usize {
	let len = size_of::<FreeChunk>() - size_of::<Chunk>();
	if len > FREE_CHUNK_MIN {
		len
	} else {
		FREE_CHUNK_MIN
	}
}

/// A set of size-bucketed free lists, shared by every block of one size class.
///
/// Bucket `i` holds chunks whose payload size lies in `[smallest * 2^i, smallest * 2^(i+1))`,
/// except the last bucket, which catches everything of that size or larger (so a freshly carved,
/// oversized block's first chunk always lands somewhere, ready to be split down later).
pub struct FreeListBins<'b> {
	bins: &'b mut [Option<NonNull<FreeChunk>>],
	smallest: usize,
}

impl<'b> FreeListBins<'b> {
	/// Wraps `bins`, whose buckets start at payload size `smallest`.
	pub fn new(bins: &'b mut [Option<NonNull<FreeChunk>>], smallest: usize) -> Self {
		Self { bins, smallest }
	}

	fn bucket(&self, size: usize) -> usize {
		let n = (size / self.smallest).checked_ilog2().unwrap_or(0) as usize;
		n.min(self.bins.len() - 1)
	}

	/// Returns a free chunk of at least `size` payload bytes, if one is available.
	///
	/// Bucket `i` (the one `size` maps to) can hold chunks smaller than `size`, since a bucket
	/// spans a range of sizes, so its chain is walked looking for a large-enough chunk. Buckets
	/// past `i` are entirely covered by sizes `>= size` by construction, so their head is returned
	/// as soon as one is found.
	pub fn find(&mut self, size: usize) -> Option<NonNull<FreeChunk>> {
		let i = self.bucket(size);
		let mut cur = self.bins[i];
		while let Some(fc) = cur {
			if unsafe { fc.as_ref().chunk.size } >= size {
				return Some(fc);
			}
			cur = unsafe { fc.as_ref().next };
		}
		self.bins[(i + 1)..].iter().copied().find_map(|b| b)
	}

	/// Inserts `fc` into the bucket matching its current size.
	pub fn insert(&mut self, mut fc: NonNull<FreeChunk>) {
		let i = self.bucket(unsafe { fc.as_ref().chunk.size });
		unsafe {
			let f = fc.as_mut();
			debug_assert!(f.prev.is_none() && f.next.is_none());
			f.next = self.bins[i];
			if let Some(mut head) = self.bins[i] {
				head.as_mut().prev = Some(fc);
			}
		}
		self.bins[i] = Some(fc);
	}

	/// Removes `fc` from whichever bucket it is currently linked in.
	pub fn remove(&mut self, mut fc: NonNull<FreeChunk>) {
		let i = self.bucket(unsafe { fc.as_ref().chunk.size });
		unsafe {
			let f = fc.as_mut();
			if self.bins[i] == Some(fc) {
				self.bins[i] = f.next;
			}
			if let Some(mut prev) = f.prev {
				prev.as_mut().next = f.next;
			}
			if let Some(mut next) = f.next {
				next.as_mut().prev = f.prev;
			}
			f.prev = None;
			f.next = None;
		}
	}
}
