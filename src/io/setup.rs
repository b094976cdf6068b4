//! Socket and durable-file setup.
//!
//! Sockets created here are overlapped-capable, associated with the
//! reactor's completion port, and configured so inline completions skip the
//! port. Files opened here satisfy the durability contract: exclusive
//! byte-range lock, preallocation, write-through, and a size check before
//! the handle is handed out.

use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_FILE_NOT_FOUND, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock::{
    closesocket, WSAGetLastError, WSASocketW, INVALID_SOCKET, SOCKET, WSA_FLAG_NO_HANDLE_INHERIT,
    WSA_FLAG_OVERLAPPED,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, GetFileSizeEx, LockFileEx, SetEndOfFile,
    SetFileCompletionNotificationModes, SetFilePointerEx, WriteFile, CREATE_NEW, FILE_BEGIN,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::WindowsProgramming::{
    FILE_SKIP_COMPLETION_PORT_ON_SUCCESS, FILE_SKIP_SET_EVENT_ON_HANDLE,
};
use windows_sys::Win32::System::IO::CreateIoCompletionPort;

use crate::constants::{is_sector_aligned, SECTOR_SIZE};

use super::ops::positioned_overlapped;
use super::reactor::Io;

/// Creation disposition for [`Io::open_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMethod {
    /// The file must not exist yet.
    Create,
    /// Open the file if it exists, create it otherwise.
    CreateOrOpen,
    /// The file must already exist.
    Open,
}

/// Closes the wrapped handle unless released. Keeps the error paths in
/// [`Io::open_file`] from leaking half-initialized handles.
struct HandleGuard {
    handle: HANDLE,
}

impl HandleGuard {
    fn new(handle: HANDLE) -> Self {
        assert!(handle != INVALID_HANDLE_VALUE);
        Self { handle }
    }

    fn release(mut self) -> HANDLE {
        let handle = self.handle;
        self.handle = INVALID_HANDLE_VALUE;
        handle
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.handle != INVALID_HANDLE_VALUE {
            // SAFETY: the guard exclusively owns an open handle.
            unsafe { CloseHandle(self.handle) };
        }
    }
}

impl Io {
    /// Creates an overlapped-capable, non-inheritable socket, associates it
    /// with the reactor's completion port, and configures inline
    /// completions to skip the port and the handle event.
    ///
    /// The returned socket is owned by the caller.
    ///
    /// # Errors
    ///
    /// Propagates socket creation, port association, and notification-mode
    /// failures; the socket is closed on every failure path.
    pub fn open_socket(&self, family: i32, socket_type: i32, protocol: i32) -> io::Result<SOCKET> {
        // SAFETY: no protocol-info structure; flags are plain bit flags.
        let socket = unsafe {
            WSASocketW(
                family,
                socket_type,
                protocol,
                core::ptr::null(),
                0,
                WSA_FLAG_OVERLAPPED | WSA_FLAG_NO_HANDLE_INHERIT,
            )
        };
        if socket == INVALID_SOCKET {
            // SAFETY: immediately after the failed call on this thread.
            let code = unsafe { WSAGetLastError() };
            return Err(io::Error::from_raw_os_error(code));
        }

        // SAFETY: both handles are valid; key 0 because the overlapped
        // back-pointer, not the key, identifies completions.
        let port = unsafe { CreateIoCompletionPort(socket as HANDLE, self.iocp, 0, 0) };
        if port == 0 {
            let err = io::Error::last_os_error();
            // SAFETY: socket created above, not yet visible to the caller.
            unsafe { closesocket(socket) };
            return Err(err);
        }
        assert!(port == self.iocp);

        // Inline-completing operations report their result from the call
        // itself; a port packet for them would be delivered twice.
        let ok = unsafe {
            SetFileCompletionNotificationModes(
                socket as HANDLE,
                (FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE) as u8,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // SAFETY: as above.
            unsafe { closesocket(socket) };
            return Err(err);
        }

        log::debug!(target: "squall::io", "socket opened and registered with the port");
        Ok(socket)
    }

    /// Opens (or creates) a durable data file of exactly `size` bytes.
    ///
    /// - `GENERIC_READ | GENERIC_WRITE`, no sharing.
    /// - Write-through always; unbuffered (direct) I/O when `direct_io`.
    ///   Fsync durability depends on write-through, so it cannot be opted
    ///   out of on this backend.
    /// - An exclusive byte-range lock over `[0, size)` is mandatory mutual
    ///   exclusion between storage processes; contention aborts.
    /// - A freshly created file is preallocated to `size` and flushed
    ///   before the handle is returned.
    ///
    /// `dir` is accepted for parity with backends that fsync the parent
    /// directory; this backend resolves `path` as given and performs no
    /// directory fsync.
    ///
    /// # Panics
    ///
    /// - `size` is zero or not sector-aligned
    /// - The lock is held by another process (diagnostic abort)
    /// - The file is smaller than `size` after opening (corruption)
    ///
    /// # Errors
    ///
    /// Propagates open, preallocation, and flush failures.
    pub fn open_file(
        &self,
        dir: HANDLE,
        path: &Path,
        size: u64,
        method: OpenMethod,
        direct_io: bool,
    ) -> io::Result<HANDLE> {
        let _ = dir;
        assert!(size > 0);
        assert!(is_sector_aligned(size));

        let wide = wide_path(path);

        let mut flags = FILE_FLAG_WRITE_THROUGH;
        if direct_io {
            flags |= FILE_FLAG_NO_BUFFERING;
        }

        let (handle, created) = match method {
            OpenMethod::Create => (create_file_raw(&wide, CREATE_NEW, flags)?, true),
            OpenMethod::Open => (create_file_raw(&wide, OPEN_EXISTING, flags)?, false),
            OpenMethod::CreateOrOpen => match create_file_raw(&wide, OPEN_EXISTING, flags) {
                Ok(handle) => (handle, false),
                Err(err) if err.raw_os_error() == Some(ERROR_FILE_NOT_FOUND as i32) => {
                    (create_file_raw(&wide, CREATE_NEW, flags)?, true)
                }
                Err(err) => return Err(err),
            },
        };
        let guard = HandleGuard::new(handle);

        lock_file_exclusive(handle, size, path);

        if created {
            preallocate(handle, size)?;
        }

        // Make the create/preallocate durable before the caller sees the
        // handle. The parent directory is not fsynced on this backend.
        // SAFETY: handle is a live file handle.
        let flushed = unsafe { FlushFileBuffers(handle) };
        if flushed == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut actual_size: i64 = 0;
        // SAFETY: out-parameter lives across the call.
        let sized = unsafe { GetFileSizeEx(handle, &mut actual_size) };
        if sized == 0 {
            return Err(io::Error::last_os_error());
        }
        assert!(
            actual_size >= 0 && actual_size as u64 >= size,
            "data file was truncated: expected at least {} bytes, found {} ({})",
            size,
            actual_size,
            path.display(),
        );

        log::info!(
            target: "squall::io",
            "data file ready: {} ({} bytes, created: {})",
            path.display(),
            size,
            created,
        );

        Ok(guard.release())
    }

    /// Opens a read-only handle on a directory.
    pub fn open_dir(&self, path: &Path) -> io::Result<HANDLE> {
        let wide = wide_path(path);

        // SAFETY: the wide string is NUL-terminated and outlives the call.
        // BACKUP_SEMANTICS is what lets CreateFileW open a directory at all.
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                GENERIC_READ,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                core::ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(handle)
    }
}

/// NUL-terminated UTF-16 rendition of `path` for the wide-character APIs.
fn wide_path(path: &Path) -> Vec<u16> {
    let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
    assert!(
        !wide.contains(&0),
        "path contains an interior NUL: {}",
        path.display()
    );
    wide.push(0);
    wide
}

fn create_file_raw(wide: &[u16], disposition: u32, flags: u32) -> io::Result<HANDLE> {
    assert!(wide.last() == Some(&0));

    // SAFETY: the wide string is NUL-terminated and outlives the call. No
    // sharing: the data file belongs to exactly one process.
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            core::ptr::null(),
            disposition,
            flags,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(handle)
}

/// Take the advisory exclusive lock over `[0, size)`, failing immediately
/// on contention. The lock is mandatory mutual exclusion between storage
/// processes, so contention is not an error to recover from: abort with a
/// diagnostic.
fn lock_file_exclusive(handle: HANDLE, size: u64, path: &Path) {
    let mut overlapped = positioned_overlapped(0);

    // SAFETY: handle is a live file handle; the overlapped carries the
    // range origin and lives across the call.
    let locked = unsafe {
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            size as u32,
            (size >> 32) as u32,
            &mut overlapped,
        )
    };
    if locked == 0 {
        // SAFETY: immediately after the failed call on this thread.
        let code = unsafe { GetLastError() };
        log::error!(
            target: "squall::io",
            "data file lock contended (os error {}): {}",
            code,
            path.display(),
        );
        panic!(
            "another process is holding the data file lock: {}",
            path.display()
        );
    }
}

/// Extend a freshly created file to `size`: pin the end-of-file marker at
/// `size`; if the kernel refuses, fall back to writing one zero sector at
/// the tail, retrying on short writes.
fn preallocate(handle: HANDLE, size: u64) -> io::Result<()> {
    assert!(size >= SECTOR_SIZE as u64);
    assert!(is_sector_aligned(size));

    let mut position: i64 = 0;
    // SAFETY: out-parameter lives across the call.
    let sought = unsafe { SetFilePointerEx(handle, size as i64, &mut position, FILE_BEGIN) };
    if sought != 0 && position == size as i64 {
        // SAFETY: handle is a live file handle.
        let pinned = unsafe { SetEndOfFile(handle) };
        if pinned != 0 {
            return Ok(());
        }
    }

    write_zero_tail(handle, size)
}

/// Preallocation fallback: a zero sector written at `size - SECTOR_SIZE`
/// forces the file to its full length.
///
/// The unbuffered handle rejects unaligned sources, and the global
/// allocator promises nothing about alignment, so the sector is allocated
/// for exactly this write and freed again.
fn write_zero_tail(handle: HANDLE, size: u64) -> io::Result<()> {
    const SECTOR: usize = SECTOR_SIZE as usize;

    let layout = std::alloc::Layout::from_size_align(SECTOR, SECTOR).expect("bad sector layout");
    // SAFETY: the layout has non-zero size.
    let sector = unsafe { std::alloc::alloc_zeroed(layout) };
    let sector = core::ptr::NonNull::new(sector).expect("sector alloc failed");
    assert!((sector.as_ptr() as usize).is_multiple_of(SECTOR));

    let result = write_all_at(handle, sector.as_ptr(), SECTOR, size - SECTOR as u64);

    // SAFETY: allocated above with this exact layout.
    unsafe { std::alloc::dealloc(sector.as_ptr(), layout) };
    result
}

/// Write `buf[0..len]` at `offset`, retrying on short writes.
fn write_all_at(handle: HANDLE, buf: *const u8, len: usize, offset: u64) -> io::Result<()> {
    let mut written_total: usize = 0;
    while written_total < len {
        let mut positioned = positioned_overlapped(offset + written_total as u64);
        let mut written: u32 = 0;

        // SAFETY: the caller keeps `buf` valid for `len` bytes; the write
        // is synchronous on this handle.
        let ok = unsafe {
            WriteFile(
                handle,
                buf.add(written_total).cast(),
                (len - written_total) as u32,
                &mut written,
                &mut positioned,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "device refused to extend the data file",
            ));
        }
        written_total += written as usize;
    }

    assert!(written_total == len);
    Ok(())
}
