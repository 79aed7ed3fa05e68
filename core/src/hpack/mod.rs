/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a concurrent HTTP client library.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! HPACK header compression (RFC 7541): static table, Huffman codec,
//! encoder and decoder with per-connection dynamic tables.

mod decoder;
mod encoder;
pub mod huffman;
pub mod static_table;

pub use decoder::HpackDecoder;
pub use encoder::HpackEncoder;

/// Default SETTINGS_HEADER_TABLE_SIZE (RFC 7540 §6.5.2).
pub const DEFAULT_HEADER_TABLE_SIZE: usize = 4096;
