// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

//! Pool-bound file descriptors and stdio streams.
//!
//! A descriptor or stream opened through a pool is registered with that pool's cleanup list, so
//! destroying the pool (a dropped connection, a finished request) closes every resource that was
//! opened for it. Closing explicitly through the pool unregisters the cleanup again, so nothing
//! is ever closed twice.
//!
//! Streams register *different* plain and child destructors on purpose: `fclose` flushes, and a
//! forked child flushing inherited buffers would emit the parent's pending output a second time.
//! The child variant closes the underlying descriptor and nothing else.

use std::ffi::{CString, c_void};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};

use crate::alarms::AlarmGuard;
use crate::error::{Error, Result};
use crate::pool::Pool;

/// Permission bits for stream creation in append mode, trimmed by the process umask.
const APPEND_CREATE_MODE: libc::c_uint = 0o666;

/// Packs a descriptor into the cleanup registry's opaque data word.
fn fd_as_data(fd: RawFd) -> *mut c_void {
    let word = usize::try_from(fd).expect("descriptors are non-negative when registered");
    ptr::without_provenance_mut(word)
}

fn data_as_fd(data: *mut c_void) -> RawFd {
    RawFd::try_from(data.addr()).expect("the data word was packed from a descriptor, so it fits")
}

fn fd_cleanup(data: *mut c_void) {
    // SAFETY: The data word was packed from a descriptor owned by the registering pool.
    unsafe {
        _ = libc::close(data_as_fd(data));
    }
}

fn stream_cleanup(data: *mut c_void) {
    // SAFETY: The data word is a stream pointer owned by the registering pool; fclose flushes
    // and closes the underlying descriptor.
    unsafe {
        _ = libc::fclose(data.cast());
    }
}

fn stream_child_cleanup(data: *mut c_void) {
    // SAFETY: As for stream_cleanup, but close the descriptor without flushing: this variant
    // runs in a forked child whose buffers belong to the parent.
    unsafe {
        _ = libc::close(libc::fileno(data.cast()));
    }
}

fn path_as_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath(path.to_path_buf()))
}

impl Pool<'_> {
    /// Opens `path` with `open(2)` and ties the descriptor's closure to this pool's lifetime.
    ///
    /// # Errors
    ///
    /// Returns the operating system's error when the open fails; nothing is registered in
    /// that case.
    pub fn open_fd(&self, path: &Path, flags: i32, mode: libc::mode_t) -> Result<RawFd> {
        let c_path = path_as_cstring(path)?;

        let _alarms = AlarmGuard::new();

        // SAFETY: A valid NUL-terminated path; the mode argument is consumed per the varargs
        // open(2) contract.
        let fd = unsafe { libc::open(c_path.as_ptr(), flags, libc::c_uint::from(mode)) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        self.register_cleanup(fd_as_data(fd), fd_cleanup, fd_cleanup);
        Ok(fd)
    }

    /// Closes a descriptor opened with [`open_fd`][Self::open_fd] and unregisters its cleanup,
    /// so pool teardown will not close it again.
    ///
    /// # Errors
    ///
    /// Returns the operating system's error when the close fails. The cleanup is unregistered
    /// either way - the descriptor is gone.
    pub fn close_fd(&self, fd: RawFd) -> Result<()> {
        let _alarms = AlarmGuard::new();

        // SAFETY: The caller owns the descriptor through this pool.
        let rc = unsafe { libc::close(fd) };
        self.unregister_cleanup(fd_as_data(fd), fd_cleanup);

        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Opens a buffered stdio stream over `path` and ties it to this pool's lifetime.
    ///
    /// Append modes (`"a"`, `"a+"`, ...) go through `open(2)` with `O_APPEND | O_CREAT` and
    /// world-writable-modulo-umask permissions, then adopt the descriptor with `fdopen(3)`; any
    /// other mode goes to `fopen(3)` directly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] / [`Error::InvalidMode`] for strings the operating system
    /// cannot accept, otherwise the OS error from the failed open. Nothing is registered on
    /// failure.
    pub fn open_stream(&self, path: &Path, mode: &str) -> Result<NonNull<libc::FILE>> {
        let c_path = path_as_cstring(path)?;
        let c_mode = CString::new(mode).map_err(|_| Error::InvalidMode(mode.to_string()))?;

        let _alarms = AlarmGuard::new();

        let stream = if mode.as_bytes().first() == Some(&b'a') {
            let base_flag = if mode.as_bytes().get(1) == Some(&b'+') {
                libc::O_RDWR
            } else {
                libc::O_WRONLY
            };

            // SAFETY: Valid NUL-terminated path and a literal mode constant.
            let fd = unsafe {
                libc::open(
                    c_path.as_ptr(),
                    base_flag | libc::O_APPEND | libc::O_CREAT,
                    APPEND_CREATE_MODE,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }

            // SAFETY: A freshly opened descriptor and a valid NUL-terminated mode.
            let raw = unsafe { libc::fdopen(fd, c_mode.as_ptr()) };
            let Some(stream) = NonNull::new(raw) else {
                let error = io::Error::last_os_error();
                // The descriptor never made it into a stream or the registry; close it here or
                // nothing ever will.
                // SAFETY: `fd` is open and owned by this function.
                unsafe {
                    _ = libc::close(fd);
                }
                return Err(error.into());
            };
            stream
        } else {
            // SAFETY: Valid NUL-terminated path and mode strings.
            let raw = unsafe { libc::fopen(c_path.as_ptr(), c_mode.as_ptr()) };
            let Some(stream) = NonNull::new(raw) else {
                return Err(io::Error::last_os_error().into());
            };
            stream
        };

        self.register_cleanup(stream.as_ptr().cast(), stream_cleanup, stream_child_cleanup);

        Ok(stream)
    }

    /// Adopts an existing descriptor into a buffered stream tied to this pool's lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMode`] for a mode string the operating system cannot accept,
    /// otherwise the OS error from `fdopen(3)`. Nothing is registered on failure and the
    /// descriptor remains the caller's.
    pub fn adopt_stream(&self, fd: RawFd, mode: &str) -> Result<NonNull<libc::FILE>> {
        let c_mode = CString::new(mode).map_err(|_| Error::InvalidMode(mode.to_string()))?;

        let _alarms = AlarmGuard::new();

        // SAFETY: The caller vouches for the descriptor; the mode string is NUL-terminated.
        let stream = unsafe { libc::fdopen(fd, c_mode.as_ptr()) };
        let Some(stream) = NonNull::new(stream) else {
            return Err(io::Error::last_os_error().into());
        };

        self.register_cleanup(stream.as_ptr().cast(), stream_cleanup, stream_child_cleanup);

        Ok(stream)
    }

    /// Closes a stream opened with [`open_stream`][Self::open_stream] or
    /// [`adopt_stream`][Self::adopt_stream] (flushing it) and unregisters its cleanup.
    ///
    /// # Errors
    ///
    /// Returns the operating system's error when the close fails. The cleanup is unregistered
    /// either way.
    pub fn close_stream(&self, stream: NonNull<libc::FILE>) -> Result<()> {
        let _alarms = AlarmGuard::new();

        // SAFETY: The caller owns the stream through this pool.
        let rc = unsafe { libc::fclose(stream.as_ptr()) };
        self.unregister_cleanup(stream.as_ptr().cast(), stream_cleanup);

        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}
