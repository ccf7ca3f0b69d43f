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

//! The buddy allocator allows allocating blocks of `2^n` page frames of physical memory.
//!
//! Memory is partitioned at boot into named [`Zone`]s (DMA, Kernel, User). Each zone carves
//! its own frames recursively in half until a frame of the requested order is available, and
//! coalesces them back together on free.
//!
//! The order of a frame is the `n` in `2^n`, the number of pages the frame spans.

use crate::memory;
use core::{
	cmp::min,
	ffi::c_void,
	hint::likely,
	mem::size_of,
	ptr::{null_mut, NonNull},
	slice,
};
use macros::instrument_allocator;
use utils::{
	errno::{AllocError, AllocResult},
	lock::IntMutex,
	math,
};

/// The order of a memory frame.
pub type FrameOrder = u8;
/// The identifier of a frame within its zone.
type FrameID = u32;

/// The maximum order of a buddy allocated frame.
pub const MAX_ORDER: FrameOrder = crate::config::MAX_ORDER;

/// The usage class a zone of physical memory is reserved for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum ZoneKind {
	/// Memory reachable by legacy DMA-only devices.
	Dma = 0,
	/// Memory reserved for kernel-owned allocations.
	Kernel = 1,
	/// Memory handed out to userspace processes.
	User = 2,
}

/// The number of memory zones.
pub const ZONES_COUNT: usize = 3;

/// Value indicating that the frame is used.
pub const FRAME_STATE_USED: FrameID = !0_u32;

/// An allocatable zone of memory, lazily populated on first use (see [`Zones::ensure_init`]).
pub(crate) struct Zone {
	/// A pointer to the beginning of the metadata of the zone
	metadata_begin: *mut Frame,
	/// A pointer to the beginning of the allocatable memory of the zone
	begin: *mut c_void,
	/// The size of the zone in pages
	pages_count: FrameID,
	/// The number of allocated pages in the zone
	allocated_pages: usize,
	/// The free list containing linked lists to free frames. Each linked list contain frames of
	/// the order corresponding to the element in this array
	free_list: [Option<NonNull<Frame>>; (MAX_ORDER + 1) as usize],
}

impl Zone {
	/// Returns a value for use as a placeholder until boot-time initialization has been performed.
	const fn placeholder() -> Self {
		Self {
			metadata_begin: null_mut(),
			begin: null_mut(),
			pages_count: 0,
			allocated_pages: 0,
			free_list: [None; (MAX_ORDER + 1) as usize],
		}
	}
}

impl Zone {
	/// Fills the free list during initialization according to the number of
	/// available pages.
	fn fill_free_list(&mut self) {
		let frames = self.frames();
		let mut frame: FrameID = 0;
		let mut order = MAX_ORDER;
		while frame < self.pages_count as FrameID {
			// Check the order fits in remaining pages
			let p = math::pow2(order as FrameID) as FrameID;
			if frame + p > self.pages_count {
				order -= 1;
				continue;
			}
			// Init frame
			let f = &mut frames[frame as usize];
			f.mark_free(self);
			f.order = order;
			f.link(self);
			// Jump to next offset
			frame += p;
		}
	}

	/// Creates a buddy allocator zone.
	///
	/// The zone covers the memory from pointer `begin` to `begin + size` where `size` is the size
	/// in bytes.
	///
	/// `metadata_begin` must be a virtual address and `begin` must be a
	/// physical address.
	pub(crate) fn new(metadata_begin: *mut c_void, pages_count: FrameID, begin: *mut c_void) -> Zone {
		let mut z = Zone {
			metadata_begin: metadata_begin as _,
			begin,
			pages_count,
			allocated_pages: 0,
			free_list: Default::default(),
		};
		z.fill_free_list();
		z
	}

	/// Returns the size in bytes of the allocatable memory.
	#[inline]
	fn get_size(&self) -> usize {
		(self.pages_count as usize) * memory::PAGE_SIZE
	}

	/// Returns an available frame owned by this zone, with an order of at least
	/// `order`.
	fn get_available_frame(&mut self, order: FrameOrder) -> Option<NonNull<Frame>> {
		let frame = self.free_list[(order as usize)..]
			.iter_mut()
			.filter_map(|f| *f)
			.next()?;
		let f = unsafe { &*frame.as_ptr() };
		debug_assert!(!f.is_used());
		debug_assert!((f.memory_ptr(self) as usize) >= (self.begin as usize));
		debug_assert!((f.memory_ptr(self) as usize) < (self.begin as usize) + self.get_size());
		Some(frame)
	}

	/// Returns the identifier for the frame at the given pointer `ptr`.
	///
	/// The pointer must point to the frame itself, not the Frame structure.
	fn get_frame_id_from_ptr(&self, ptr: *const c_void) -> FrameID {
		(((ptr as usize) - (self.begin as usize)) / memory::PAGE_SIZE) as _
	}

	/// Returns a mutable slice over the metadata of the zone's frames.
	#[inline]
	fn frames(&self) -> &'static mut [Frame] {
		unsafe { slice::from_raw_parts_mut(self.metadata_begin, self.pages_count as usize) }
	}
}

/// The metadata for a frame of physical memory.
///
/// The structure has an internal linked list for the free list.
/// This linked list doesn't store pointers but frame identifiers to save memory.
///
/// If either `prev` or `next` has value [`FRAME_STATE_USED`], the frame is marked as used.
///
/// If a frame points to itself, it means that no more elements are present in
/// the list.
#[repr(packed)]
struct Frame {
	/// Identifier of the previous frame in the free list.
	prev: FrameID,
	/// Identifier of the next frame in the free list.
	next: FrameID,

	/// Order of the current frame
	order: FrameOrder,
}

impl Frame {
	/// Returns the id of the current frame in the associated zone `zone`.
	fn get_id(&self, zone: &Zone) -> FrameID {
		let self_off = self as *const _ as usize;
		let zone_off = zone.metadata_begin as *const _ as usize;
		debug_assert!(self_off >= zone_off);

		((self_off - zone_off) / size_of::<Self>()) as u32
	}

	/// Returns the identifier of the buddy frame in zone `zone`, taking in
	/// account the frame's order.
	///
	/// The caller has the responsibility to check that it is below the number of frames in the
	/// zone.
	#[inline]
	fn get_buddy_id(&self, zone: &Zone) -> FrameID {
		self.get_id(zone) ^ (1 << self.order) as u32
	}

	/// Returns the pointer to the location of the associated physical memory.
	fn memory_ptr(&self, zone: &Zone) -> *mut c_void {
		let off = self.get_id(zone) as usize * memory::PAGE_SIZE;
		(zone.begin as usize + off) as _
	}

	/// Tells whether the frame is used or not.
	#[inline]
	fn is_used(&self) -> bool {
		(self.prev == FRAME_STATE_USED) || (self.next == FRAME_STATE_USED)
	}

	/// Returns the size of the frame in bytes.
	#[inline]
	fn get_size(&self) -> usize {
		get_frame_size(self.order)
	}

	/// Marks the frame as used. The frame must not be linked to any free list.
	#[inline]
	fn mark_used(&mut self) {
		self.prev = FRAME_STATE_USED;
		self.next = FRAME_STATE_USED;
	}

	/// Marks the frame as free. The frame must not be linked to any free list.
	#[inline]
	fn mark_free(&mut self, zone: &Zone) {
		let id = self.get_id(zone);
		self.prev = id;
		self.next = id;
	}

	/// Links the frame into zone `zone`'s free list.
	fn link(&mut self, zone: &mut Zone) {
		debug_assert!(!self.is_used());

		let id = self.get_id(zone);
		self.prev = id;
		self.next = if let Some(mut next) = zone.free_list[self.order as usize] {
			let next = unsafe { next.as_mut() };
			debug_assert!(!next.is_used());
			next.prev = id;
			next.get_id(zone)
		} else {
			id
		};
		zone.free_list[self.order as usize] = NonNull::new(self);
	}

	/// Unlinks the frame from zone `zone`'s free list. The frame must not be
	/// used.
	fn unlink(&mut self, zone: &mut Zone) {
		debug_assert!(!self.is_used());

		let frames = zone.frames();
		let id = self.get_id(zone);
		let has_prev = self.prev != id;
		let has_next = self.next != id;

		let first = &mut zone.free_list[self.order as usize];
		if first.map(NonNull::as_ptr) == Some(self) {
			*first = if has_next {
				NonNull::new(&mut frames[self.next as usize])
			} else {
				None
			};
		}

		if has_prev {
			frames[self.prev as usize].next = if has_next { self.next } else { self.prev };
		}
		if has_next {
			frames[self.next as usize].prev = if has_prev { self.prev } else { self.next };
		}
	}

	/// Unlinks the frame from zone `zone`'s free list, splits it until it
	/// reaches the required order `order` while linking the new free frames to
	/// the free list.
	///
	/// At the end of the function, the current frame is **not** linked to the free list.
	///
	/// The frame must not be marked as used.
	fn split(&mut self, zone: &mut Zone, order: FrameOrder) {
		debug_assert!(!self.is_used());
		debug_assert!(order <= MAX_ORDER);
		debug_assert!(self.order >= order);

		let frames = zone.frames();

		self.unlink(zone);
		while self.order > order {
			self.order -= 1;
			// Get buddy ID
			let buddy = self.get_buddy_id(zone);
			if buddy >= zone.pages_count {
				break;
			}
			// Update buddy
			let buddy_frame = &mut frames[buddy as usize];
			buddy_frame.mark_free(zone);
			buddy_frame.order = self.order;
			buddy_frame.link(zone);
		}
	}

	/// Coalesces the frame in zone `zone` with free buddy blocks recursively
	/// until no buddy is available anymore, or the zone boundary is reached.
	///
	/// The current frame must not be marked as used.
	///
	/// Buddies that are merged with the frame are unlinked.
	///
	/// The order of the frame is incremented at each merge.
	///
	/// The frame is linked to the free list by the function.
	fn coalesce(&mut self, zone: &mut Zone) {
		debug_assert!(!self.is_used());

		let frames = zone.frames();

		while self.order < MAX_ORDER {
			let id = self.get_id(zone);
			// Get buddy ID
			let buddy = self.get_buddy_id(zone);
			if buddy >= zone.pages_count {
				break;
			}
			// Check if coalesce is possible
			let new_pages_count = math::pow2((self.order + 1) as u32) as FrameID;
			if min(id, buddy) + new_pages_count > zone.pages_count {
				break;
			}
			let buddy_frame = &mut frames[buddy as usize];
			if buddy_frame.order != self.order || buddy_frame.is_used() {
				break;
			}
			// Update buddy
			buddy_frame.unlink(zone);
			if id < buddy {
				self.order += 1;
			} else {
				buddy_frame.order += 1;
				buddy_frame.coalesce(zone);
				return;
			}
		}

		self.link(zone);
	}
}

/// The number of pages backing the DMA zone.
const DMA_PAGES: usize = crate::config::DMA_ZONE_PAGES;
/// The number of pages backing the kernel zone.
const KERNEL_PAGES: usize = crate::config::KERNEL_ZONE_PAGES;
/// The number of pages backing the user zone.
const USER_PAGES: usize = crate::config::USER_ZONE_PAGES;

/// The zones together with the storage backing them.
///
/// Without a boot-time memory map (multiboot/e820 parsing belongs to the boot layer, out of
/// scope here), a zone cannot be populated from real discovered RAM. Instead each zone is handed
/// a compile-time-sized pool living inside this very struct: since the struct is a `static`, its
/// address is fixed for the program's lifetime, so the pointers [`Zone::new`] is given into the
/// sibling array fields stay valid forever, the same way a boot-time zone would point into
/// memory the bootloader promised wouldn't move.
struct Zones {
	zones: [Zone; ZONES_COUNT],
	initialized: bool,
	dma_memory: [u8; DMA_PAGES * memory::PAGE_SIZE],
	dma_metadata: [u8; DMA_PAGES * size_of::<Frame>()],
	kernel_memory: [u8; KERNEL_PAGES * memory::PAGE_SIZE],
	kernel_metadata: [u8; KERNEL_PAGES * size_of::<Frame>()],
	user_memory: [u8; USER_PAGES * memory::PAGE_SIZE],
	user_metadata: [u8; USER_PAGES * size_of::<Frame>()],
}

impl Zones {
	/// Populates the zones with their backing storage, the first time this is called.
	fn ensure_init(&mut self) {
		if self.initialized {
			return;
		}
		self.initialized = true;
		self.zones[ZoneKind::Dma as usize] = Zone::new(
			self.dma_metadata.as_mut_ptr() as *mut c_void,
			DMA_PAGES as FrameID,
			self.dma_memory.as_mut_ptr() as *mut c_void,
		);
		self.zones[ZoneKind::Kernel as usize] = Zone::new(
			self.kernel_metadata.as_mut_ptr() as *mut c_void,
			KERNEL_PAGES as FrameID,
			self.kernel_memory.as_mut_ptr() as *mut c_void,
		);
		self.zones[ZoneKind::User as usize] = Zone::new(
			self.user_metadata.as_mut_ptr() as *mut c_void,
			USER_PAGES as FrameID,
			self.user_memory.as_mut_ptr() as *mut c_void,
		);
	}
}

/// The array of buddy allocator zones, indexed by [`ZoneKind`], together with their backing
/// storage.
static ZONES: IntMutex<Zones> = IntMutex::new(Zones {
	zones: [Zone::placeholder(), Zone::placeholder(), Zone::placeholder()],
	initialized: false,
	dma_memory: [0; DMA_PAGES * memory::PAGE_SIZE],
	dma_metadata: [0; DMA_PAGES * size_of::<Frame>()],
	kernel_memory: [0; KERNEL_PAGES * memory::PAGE_SIZE],
	kernel_metadata: [0; KERNEL_PAGES * size_of::<Frame>()],
	user_memory: [0; USER_PAGES * memory::PAGE_SIZE],
	user_metadata: [0; USER_PAGES * size_of::<Frame>()],
});

/// The size in bytes of a frame with the given order `order`.
#[inline]
pub fn get_frame_size(order: FrameOrder) -> usize {
	memory::PAGE_SIZE << order
}

/// Returns the buddy order required to fit the given number of pages.
#[inline]
pub fn get_order(pages: usize) -> FrameOrder {
	if likely(pages != 0) {
		(u32::BITS - pages.leading_zeros()) as _
	} else {
		0
	}
}

/// Returns the size of the metadata for one frame.
#[inline]
pub const fn get_frame_metadata_size() -> usize {
	size_of::<Frame>()
}

/// Returns a mutable reference to the zone that contains the given pointer `ptr`.
fn get_zone_for_pointer(zones: &mut [Zone; ZONES_COUNT], ptr: *const c_void) -> Option<&mut Zone> {
	zones
		.iter_mut()
		.find(|z| ptr >= z.begin && (ptr as usize) < (z.begin as usize) + z.get_size())
}

/// Allocates a frame of memory using the buddy allocator.
///
/// Arguments:
/// - `order` is the order of the frame to be allocated
/// - `zone` is the preferred zone to allocate from; if it has no frame available, the search
///   falls through to the zones after it
///
/// If no suitable frame is found in `zone` or any zone after it, the function returns an error.
///
/// On success, the function returns a *physical* pointer to the allocated memory.
#[instrument_allocator(name = buddy, op = alloc, size = order, scale = log2)]
pub fn alloc(order: FrameOrder, zone: ZoneKind) -> AllocResult<NonNull<c_void>> {
	if order > MAX_ORDER {
		return Err(AllocError);
	}
	// Select a zone and frame to allocate on
	let mut zones = ZONES.lock();
	zones.ensure_init();
	let begin_zone = zone as usize;
	let (frame, zone) = zones.zones[begin_zone..]
		.iter_mut()
		.filter_map(|z| Some((z.get_available_frame(order)?, z)))
		.next()
		.ok_or(AllocError)?;
	let frame = unsafe { &mut *frame.as_ptr() };
	// Do the actual allocation
	debug_assert!(!frame.is_used());
	frame.split(zone, order);
	let ptr = frame.memory_ptr(zone);
	debug_assert!(ptr.is_aligned_to(memory::PAGE_SIZE));
	debug_assert!(ptr >= zone.begin && ptr < (zone.begin as usize + zone.get_size()) as _);
	frame.mark_used();
	// Statistics
	let pages_count = math::pow2(order as u32);
	zone.allocated_pages += pages_count;
	NonNull::new(ptr).ok_or(AllocError)
}

/// Calls [`alloc()`] with order `order`, allocating in the kernel zone.
///
/// Elsewhere in this crate, a zone's "physical" address and its kernel-mapped virtual address are
/// two different things related by [`memory::PhysAddr::kernel_to_virtual`]; here, since the
/// backing storage is a zone-owned static array rather than memory a boot-time identity map
/// exposes at a translated offset, the two coincide and no conversion is needed.
pub fn alloc_kernel(order: FrameOrder) -> AllocResult<NonNull<c_void>> {
	alloc(order, ZoneKind::Kernel)
}

/// Frees the given memory frame that was allocated using the buddy allocator.
///
/// Arguments:
/// - `ptr` is the *physical* address to the beginning of the frame
/// - `order` is the order of the frame
///
/// The given order must be the same as the one given to [`alloc()`].
///
/// # Safety
///
/// If the `ptr` or `order` are invalid, the behaviour is undefined.
///
/// Using the memory referenced by the pointer after freeing results in an undefined behaviour.
#[instrument_allocator(name = buddy, op = free, ptr = ptr, size = order, scale = log2)]
pub unsafe fn free(ptr: *const c_void, order: FrameOrder) {
	debug_assert!(ptr.is_aligned_to(memory::PAGE_SIZE));
	debug_assert!(order <= MAX_ORDER);
	// Get zone
	let mut zones = ZONES.lock();
	zones.ensure_init();
	let zone = get_zone_for_pointer(&mut zones.zones, ptr).unwrap();
	let frames = zone.frames();
	// Perform free
	let frame_id = zone.get_frame_id_from_ptr(ptr);
	debug_assert!(frame_id < zone.pages_count);
	let frame = &mut frames[frame_id as usize];
	debug_assert!(frame.is_used());
	frame.mark_free(zone);
	frame.coalesce(zone);
	// Statistics
	let pages_count = math::pow2(order as u32);
	zone.allocated_pages -= pages_count;
}

/// Frees the given memory frame that was allocated with [`alloc_kernel`].
///
/// Arguments:
/// - `ptr` is the address returned by [`alloc_kernel`]
/// - `order` is the order of the frame
///
/// # Safety
///
/// See [`free`]
pub unsafe fn free_kernel(ptr: *const c_void, order: FrameOrder) {
	free(ptr, order);
}

/// Returns the total number of pages allocated by the buddy allocator.
pub fn allocated_pages_count() -> usize {
	let mut zones = ZONES.lock();
	zones.ensure_init();
	zones.zones.iter().map(|z| z.allocated_pages).sum()
}

#[cfg(test)]
mod test {
	use super::*;
	use core::{ptr::null, slice};

	#[test_case]
	fn buddy0() {
		let alloc_pages = allocated_pages_count();
		unsafe {
			let p = alloc_kernel(0).unwrap();
			let slice = slice::from_raw_parts_mut(p.as_ptr() as *mut u8, get_frame_size(0));
			slice.fill(!0);
			free_kernel(p.as_ptr(), 0);
		}
		assert_eq!(allocated_pages_count(), alloc_pages);
	}

	#[test_case]
	fn buddy1() {
		let alloc_pages = allocated_pages_count();
		unsafe {
			let p = alloc_kernel(1).unwrap();
			let slice = slice::from_raw_parts_mut(p.as_ptr() as *mut u8, get_frame_size(0));
			slice.fill(!0);
			free_kernel(p.as_ptr(), 1);
		}
		assert_eq!(allocated_pages_count(), alloc_pages);
	}

	fn lifo_test(i: usize) {
		unsafe {
			let p = alloc_kernel(0).unwrap();
			let slice = slice::from_raw_parts_mut(p.as_ptr() as *mut u8, get_frame_size(0));
			slice.fill(!0);
			if i > 0 {
				lifo_test(i - 1);
			}
			free_kernel(p.as_ptr(), 0);
		}
	}

	#[test_case]
	fn buddy_lifo() {
		let alloc_pages = allocated_pages_count();
		lifo_test(100);
		assert_eq!(allocated_pages_count(), alloc_pages);
	}

	#[test_case]
	fn buddy_fifo() {
		let alloc_pages = allocated_pages_count();
		unsafe {
			let mut frames: [*const c_void; 100] = [null::<c_void>(); 100];
			for frame in &mut frames {
				let p = alloc_kernel(0).unwrap();
				*frame = p.as_ptr();
			}
			for frame in frames {
				free_kernel(frame, 0);
			}
		}
		assert_eq!(allocated_pages_count(), alloc_pages);
	}

	fn get_dangling(order: FrameOrder) -> *mut c_void {
		unsafe {
			let p = alloc_kernel(order).unwrap();
			let slice = slice::from_raw_parts_mut(p.as_ptr() as *mut u8, get_frame_size(0));
			slice.fill(!0);
			free_kernel(p.as_ptr(), 0);
			p.as_ptr()
		}
	}

	#[test_case]
	fn buddy_free() {
		let alloc_pages = allocated_pages_count();
		let first = get_dangling(0);
		for _ in 0..100 {
			assert_eq!(get_dangling(0), first);
		}
		assert_eq!(allocated_pages_count(), alloc_pages);
	}

	struct TestDupNode {
		next: Option<NonNull<TestDupNode>>,
	}

	unsafe fn has_cycle(begin: NonNull<TestDupNode>) -> bool {
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

	/// Exhausts the kernel zone at order 0, checking that every frame handed out is distinct
	/// (detected via a Floyd cycle check on a linked list threaded through the frames
	/// themselves), then that freeing them all restores the initial count.
	#[test_case]
	fn buddy_exhaustion() {
		let alloc_pages = allocated_pages_count();
		unsafe {
			let mut first: Option<NonNull<TestDupNode>> = None;
			while let Ok(p) = alloc_kernel(0) {
				let mut node = p.cast::<TestDupNode>();
				node.as_mut().next = first;
				first = Some(node);
			}
			assert!(!has_cycle(first.unwrap()));
			while let Some(node) = first {
				let next = (*node.as_ptr()).next;
				free_kernel(node.as_ptr() as *const _, 0);
				first = next;
			}
		}
		assert_eq!(allocated_pages_count(), alloc_pages);
	}

	/// Allocates an order-8 and an order-0 block on every iteration, memsets both, and frees both
	/// before the next iteration, 1024 times in a row.
	#[test_case]
	fn order_mix() {
		let alloc_pages = allocated_pages_count();
		unsafe {
			for _ in 0..1024 {
				let big = alloc_kernel(8).unwrap();
				let small = alloc_kernel(0).unwrap();
				slice::from_raw_parts_mut(big.as_ptr() as *mut u8, get_frame_size(8)).fill(0xff);
				slice::from_raw_parts_mut(small.as_ptr() as *mut u8, get_frame_size(0)).fill(0xff);
				free_kernel(big.as_ptr(), 8);
				free_kernel(small.as_ptr(), 0);
			}
		}
		assert_eq!(allocated_pages_count(), alloc_pages);
	}
}
