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

//! Kernel panic handling.
//!
//! A kernel panic occurs when an error is raised that the kernel cannot recover from: a broken
//! allocator invariant, a double free, an assertion failure. There is no reboot path at this
//! layer; the CPU halts.

use crate::{arch::x86, logger::LOGGER, println};
use core::{
	fmt,
	panic::{Location, PanicInfo},
};

fn panic_impl(msg: impl fmt::Display, loc: Option<&Location>) -> ! {
	x86::cli();
	LOGGER.lock().silent = false;
	println!("-- KERNEL PANIC! --");
	match loc {
		Some(loc) => println!("Reason: {msg} Location: {loc}"),
		None => println!("Reason: {msg}"),
	}
	println!("-- end trace --");
	loop {
		x86::hlt();
	}
}

#[panic_handler]
fn panic(panic_info: &PanicInfo) -> ! {
	panic_impl(panic_info.message(), panic_info.location());
}

#[lang = "eh_personality"]
fn eh_personality() {}
