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

//! Maestro is a Unix kernel written in Rust. This crate holds its core: the physical frame
//! allocator, the pages and kmalloc heap built on it, and the process/scheduler/semaphore
//! subsystem.
//!
//! Everything that would turn this core into a bootable kernel image — the boot shim,
//! GDT/IDT/TSS bring-up, drivers, the ACPI AML parser, the filesystem, the ELF loader and the
//! syscall dispatch surface — is a collaborator this crate does not own.
//!
//! # Features
//!
//! The crate has the following features:
//! - `memtrace`: if enabled, allocator calls are instrumented for sampling (see
//!   [`macros::instrument_allocator`]). This is a debug feature.

#![no_std]
#![feature(allow_internal_unstable)]
#![feature(custom_test_frameworks)]
#![feature(lang_items)]
#![feature(likely_unlikely)]
#![feature(pointer_is_aligned_to)]
#![deny(missing_docs)]
#![allow(clippy::tabs_in_doc_comments)]
#![allow(dead_code)]
#![test_runner(crate::selftest::runner)]
#![reexport_test_harness_main = "kernel_selftest"]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod logger;
pub mod memory;
pub mod panic;
#[macro_use]
pub mod print;
pub mod process;
pub mod selftest;

pub use utils;
