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

//! In the small/medium heap, a block is a run of pages drawn from [`super::super::pages`], too
//! big to hand out directly, that gets divided into [`Chunk`]s.
//!
//! Small and medium requests are served from blocks of a fixed page count for their class; large
//! requests get a standalone block sized to exactly fit, with no subdivision at all.

use super::chunk::{Chunk, FreeChunk};
use crate::memory::{self, pages};
use core::{
	ffi::c_void,
	mem::{offset_of, size_of},
	ptr,
	ptr::NonNull,
};
use utils::errno::AllocResult;

/// The number of pages drawn from the pages allocator for a small-class block.
pub const SMALL_BLOCK_PAGES: usize = 8;
/// The number of pages drawn from the pages allocator for a medium-class block.
pub const MEDIUM_BLOCK_PAGES: usize = 128;
/// The size in bytes of a block's header.
pub const BLOCK_HDR_SIZE: usize = size_of::<Block>();

/// A run of pages subdivided into chunks (small/medium classes), or a single large allocation.
#[repr(C, align(16))]
pub struct Block {
	/// The number of pages backing this block.
	pages: usize,
	/// The first chunk of the block. For a large allocation this chunk spans the whole block and
	/// is never split or put in a free list.
	pub first_chunk: Chunk,
}

impl Block {
	/// Allocates a new block of `pages` pages, all of it held by a single free chunk.
	///
	/// The underlying chunk created by this function is **not** inserted into any free list.
	pub fn new(pages: usize) -> AllocResult<&'static mut Self> {
		let first_chunk_size = pages * memory::PAGE_SIZE - size_of::<Block>();
		let block = unsafe {
			let ptr = pages::pages_alloc(pages)?;
			let mut ptr = ptr.cast::<Self>();
			ptr::write_volatile(
				ptr.as_mut(),
				Self {
					pages,
					first_chunk: Chunk::new(),
				},
			);
			ptr.as_mut()
		};
		*block.first_chunk.as_free_chunk().unwrap() = FreeChunk::new(first_chunk_size);
		Ok(block)
	}

	/// Allocates a standalone block sized to hold exactly `min_size` payload bytes, for the large
	/// size class. Its single chunk is marked used and never split or freed into a free list.
	pub fn new_large(min_size: usize) -> AllocResult<&'static mut Self> {
		let total = size_of::<Block>() + min_size;
		let pages = total.div_ceil(memory::PAGE_SIZE);
		let block = unsafe {
			let ptr = pages::pages_alloc(pages)?;
			let mut ptr = ptr.cast::<Self>();
			ptr::write_volatile(
				ptr.as_mut(),
				Self {
					pages,
					first_chunk: Chunk::new(),
				},
			);
			ptr.as_mut()
		};
		let chunk_size = pages * memory::PAGE_SIZE - size_of::<Block>();
		*block.first_chunk.as_free_chunk().unwrap() = FreeChunk::new(chunk_size);
		block.first_chunk.used = true;
		Ok(block)
	}

	/// Returns the number of pages backing this block.
	pub fn pages_count(&self) -> usize {
		self.pages
	}

	/// Returns a mutable reference to the block whose first chunk's reference is passed as
	/// argument.
	pub unsafe fn from_first_chunk(chunk: *mut Chunk) -> &'static mut Block {
		let first_chunk_off = offset_of!(Block, first_chunk);
		let ptr = ((chunk as usize) - first_chunk_off) as *mut Self;
		&mut *ptr
	}
}

impl Drop for Block {
	fn drop(&mut self) {
		let ptr = NonNull::new(self as *mut _ as *mut c_void).unwrap();
		pages::pages_free(ptr, self.pages);
	}
}
