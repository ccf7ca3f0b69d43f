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

//! Compile-time tunables.
//!
//! The booted kernel reads some of these from a command line; without the boot shim there is no
//! command line to parse, so this keeps only the constant-table half of that concern.

/// Maximum buddy order: the largest block the frame allocator ever hands out is `2^MAX_ORDER`
/// frames.
pub const MAX_ORDER: u8 = 17;

/// The number of pages backing the DMA zone.
///
/// Without a boot-time memory map (multiboot/e820 parsing is out of scope here), each buddy zone
/// is a compile-time-sized pool carved out of the kernel's own image rather than discovered RAM.
pub const DMA_ZONE_PAGES: usize = 128;

/// The number of pages backing the kernel zone.
pub const KERNEL_ZONE_PAGES: usize = 2048;

/// The number of pages backing the user zone.
pub const USER_ZONE_PAGES: usize = 2048;
