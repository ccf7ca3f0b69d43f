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

//! Procedural macros for the kernel core.

#![deny(warnings)]

extern crate proc_macro;

mod allocator;

use proc_macro::TokenStream;

/// Wraps an allocator function (`buddy::alloc`, `pages::alloc`, `malloc::alloc`, ...) with
/// sampling calls gated behind the `memtrace` feature.
///
/// Metadata syntax: `name = <ident>, op = alloc|realloc|free [, ptr = <arg>] [, size = <arg>]
/// [, scale = linear|log2]`.
#[proc_macro_attribute]
pub fn instrument_allocator(metadata: TokenStream, input: TokenStream) -> TokenStream {
	allocator::instrument_allocator(metadata, input)
}
