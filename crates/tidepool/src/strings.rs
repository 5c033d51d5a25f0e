// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

//! String operations backed by pool memory. Daemon code builds paths, reply lines and
//! configuration values out of these; everything lives exactly as long as the pool.

use std::ptr;
use std::slice;
use std::str;

use crate::Pool;
use crate::pool::palloc_raw;

impl Pool<'_> {
    /// Copies `s` into pool memory.
    #[must_use]
    pub fn strdup(&self, s: &str) -> &str {
        if s.is_empty() {
            return "";
        }

        // SAFETY: The region is freshly carved, the copy initializes all of it, and the bytes
        // are a verbatim copy of valid UTF-8.
        unsafe {
            let data = palloc_raw(self.inner_ptr(), s.len());
            ptr::copy_nonoverlapping(s.as_ptr(), data, s.len());
            str::from_utf8_unchecked(slice::from_raw_parts(data, s.len()))
        }
    }

    /// Copies at most `max_bytes` bytes of `s` into pool memory, backing off to the nearest
    /// character boundary so the result is always valid UTF-8.
    #[must_use]
    pub fn strndup(&self, s: &str, max_bytes: usize) -> &str {
        let mut end = max_bytes.min(s.len());
        while !s.is_char_boundary(end) {
            end -= 1;
        }

        self.strdup(&s[..end])
    }

    /// Concatenates `parts` into a single pool-backed string. An empty part list yields `""`.
    #[must_use]
    pub fn concat(&self, parts: &[&str]) -> &str {
        let len: usize = parts.iter().map(|part| part.len()).sum();
        if len == 0 {
            return "";
        }

        // SAFETY: The parts' lengths sum to exactly `len`, so the copies initialize the whole
        // region and never run past it; every byte copied is valid UTF-8.
        unsafe {
            let data = palloc_raw(self.inner_ptr(), len);

            let mut at = data;
            for part in parts {
                ptr::copy_nonoverlapping(part.as_ptr(), at, part.len());
                at = at.add(part.len());
            }

            str::from_utf8_unchecked(slice::from_raw_parts(data, len))
        }
    }

    /// Joins path components into a single pool-backed string with exactly one `/` at each seam:
    /// a separator is inserted where neither side supplies one and collapsed where both do. A
    /// leading empty component anchors the result at the filesystem root.
    ///
    /// ```
    /// use tidepool::Pool;
    ///
    /// let pool = Pool::new();
    /// assert_eq!(pool.join_paths(&["/var", "log", "", "app.log"]), "/var/log/app.log");
    /// assert_eq!(pool.join_paths(&["", "etc"]), "/etc");
    /// pool.destroy();
    /// ```
    #[must_use]
    pub fn join_paths(&self, parts: &[&str]) -> &str {
        let mut len = 0usize;
        join_seams(parts, |piece| len += piece.len());

        if len == 0 {
            return "";
        }

        // SAFETY: Both passes run the identical seam state machine, so the fill emits exactly
        // `len` bytes. Every emitted piece is either an ASCII slash or a suffix of a part that
        // begins after an ASCII byte, so the result is valid UTF-8.
        unsafe {
            let data = palloc_raw(self.inner_ptr(), len);

            let mut at = data;
            join_seams(parts, |piece| {
                ptr::copy_nonoverlapping(piece.as_ptr(), at, piece.len());
                at = at.add(piece.len());
            });

            str::from_utf8_unchecked(slice::from_raw_parts(data, len))
        }
    }
}

/// Drives the seam state machine over `parts`, handing every output piece to `emit`. Used twice
/// per join: once to measure, once to fill.
fn join_seams(parts: &[&str], mut emit: impl FnMut(&[u8])) {
    // Last byte emitted so far; 0 means nothing emitted yet.
    let mut last: u8 = 0;

    for (index, part) in parts.iter().enumerate() {
        if index == 0 && part.is_empty() {
            emit(b"/");
            last = b'/';
            continue;
        }

        let mut bytes = part.as_bytes();

        if last != 0 {
            if last == b'/' {
                if bytes.first() == Some(&b'/') {
                    bytes = &bytes[1..];
                }
            } else if bytes.first() != Some(&b'/') {
                emit(b"/");
                last = b'/';
            }
        }

        if !bytes.is_empty() {
            emit(bytes);
            last = bytes[bytes.len() - 1];
        }
    }
}
