//! Async I/O over the Windows completion port API (IOCP).
//!
//! Single-threaded, completion-based engine multiplexing TCP socket
//! operations, positional file I/O, descriptor close, and monotonic timers
//! over one I/O completion port plus an in-process timer list.
//!
//! The API is split into:
//! - [`Io`]: submit operations and drive the flush cycle
//! - [`Operation`]: per-op state (accept/connect/send/recv/read/write/close/timeout)
//! - [`Completion`]: per-op control block, callback, and intrusive link
//!
//! # Safety / Ownership
//!
//! `Completion` values must have a stable address (pinned or otherwise
//! immovable) from submission until the callback fires. Buffers are
//! caller-owned; this layer stores raw pointers. The kernel identifies an
//! operation by the `OVERLAPPED` embedded in its completion; the owning
//! completion is recovered through an explicit back-pointer installed at
//! submission time.

pub mod error;
mod ops;
mod reactor;
mod setup;

#[cfg(not(windows))]
compile_error!("This I/O engine targets Windows I/O completion ports only.");

use core::ffi::c_void;
use core::ptr::NonNull;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Networking::WinSock::{SOCKADDR_STORAGE, SOCKET};
use windows_sys::Win32::System::IO::OVERLAPPED;

use crate::constants::BUFFER_LIMIT_MAX;
use crate::stdx::{QueueLink, QueueNode};

pub use error::{
    AcceptError, CloseError, ConnectError, ReadError, RecvError, SendError, TimeoutError,
    WriteError,
};
pub use reactor::Io;
pub use setup::OpenMethod;

/// Intrusive queue tag. A [`Completion`] is on at most one of the engine's
/// queues (timers or ready) at any instant.
pub(crate) enum IoTag {}

/// Dual-address output buffer length for the accept path: room for the local
/// and remote addresses, each padded by 16 bytes as the kernel requires.
pub const ACCEPT_ADDRESS_BUFFER_LEN: usize = 2 * (size_of::<SOCKADDR_STORAGE>() + 16);

/// Kernel `OVERLAPPED` record plus the back-pointer to its owning
/// [`Completion`].
///
/// `repr(C)` with the raw record first: the pointer the completion port
/// returns is the address of `raw`, which is also the address of this block,
/// so the owner is recovered by reading `completion`, not by offset
/// arithmetic.
#[repr(C)]
pub struct Overlapped {
    pub(crate) raw: OVERLAPPED,
    pub(crate) completion: *mut Completion,
}

const _: () = assert!(
    core::mem::offset_of!(Overlapped, raw) == 0,
    "kernel hands back the address of `raw`; it must coincide with the block"
);

impl Overlapped {
    fn new() -> Self {
        Self {
            // SAFETY: OVERLAPPED is a plain C record; all-zero is its
            // documented initial state.
            raw: unsafe { core::mem::zeroed() },
            completion: core::ptr::null_mut(),
        }
    }

    /// Zero the kernel record and (re)install the owner back-pointer.
    /// Called once per submission, before the op is handed to the kernel.
    pub(crate) fn rearm(&mut self, completion: *mut Completion) {
        assert!(!completion.is_null());

        // SAFETY: as in `new`; the kernel requires a zeroed record per op.
        self.raw = unsafe { core::mem::zeroed() };
        self.completion = completion;
    }

    /// Translate a kernel-returned overlapped pointer back to its completion.
    ///
    /// # Safety
    ///
    /// `overlapped` must be the `raw` field of an [`Overlapped`] whose owning
    /// completion is still alive (guaranteed by the submission contract).
    pub(crate) unsafe fn completion_of(overlapped: *mut OVERLAPPED) -> NonNull<Completion> {
        assert!(!overlapped.is_null());

        let block = overlapped.cast::<Overlapped>();
        // SAFETY: caller guarantees `block` is a live Overlapped.
        let completion = unsafe { (*block).completion };
        assert!(!completion.is_null(), "overlapped lost its owner");

        // SAFETY: non-null checked above.
        unsafe { NonNull::new_unchecked(completion) }
    }
}

/// Callback invoked when an accept completes: the new connection's socket,
/// already associated with the engine's completion port.
pub type AcceptCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<SOCKET, AcceptError>,
);

/// Callback invoked when a connect completes.
pub type ConnectCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<(), ConnectError>,
);

/// Callback invoked when a send completes with the bytes transferred.
pub type SendCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<usize, SendError>,
);

/// Callback invoked when a receive completes with the bytes transferred.
/// Zero bytes on a stream socket means the peer shut down the connection.
pub type RecvCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<usize, RecvError>,
);

/// Callback invoked when a positional read completes. Zero bytes means
/// end-of-file.
pub type ReadCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<usize, ReadError>,
);

/// Callback invoked when a positional write completes.
pub type WriteCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<usize, WriteError>,
);

/// Callback invoked when a close completes.
pub type CloseCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<(), CloseError>,
);

/// Callback invoked when a timer expires. `Canceled` is reserved and never
/// produced by this backend.
pub type TimeoutCallback = unsafe fn(
    context: *mut c_void,
    io: &mut Io,
    completion: &mut Completion,
    result: Result<(), TimeoutError>,
);

/// Engine wrapper driving one operation forward. Re-entered by the flush
/// cycle every time the completion becomes ready (initial attempt and each
/// kernel completion).
pub(crate) type DispatchFn = unsafe fn(io: &mut Io, completion: NonNull<Completion>);

/// Describes an I/O operation and carries its in-flight state.
///
/// # Buffer Ownership
///
/// `Send`/`Recv`/`Read`/`Write` hold raw pointers to caller-owned buffers.
/// Buffers must remain valid and immovable until the callback fires. `len`
/// is `u32` to match kernel byte-count types.
pub enum Operation {
    /// No operation. Used as a sentinel for unsubmitted [`Completion`]s.
    Nop,
    /// Accept one connection on `listen_socket`.
    ///
    /// `client_socket == INVALID_SOCKET` means the accept has not been
    /// issued yet; a valid socket means it was started and the next entry
    /// polls the overlapped result.
    Accept {
        listen_socket: SOCKET,
        client_socket: SOCKET,
        address_buffer: [u8; ACCEPT_ADDRESS_BUFFER_LEN],
        callback: AcceptCallback,
    },
    /// Connect `socket` to `address`.
    Connect {
        socket: SOCKET,
        address: socket2::SockAddr,
        pending: bool,
        callback: ConnectCallback,
    },
    /// Send `buf[0..len]` on a connected socket.
    Send {
        socket: SOCKET,
        buf: *const u8,
        len: u32,
        pending: bool,
        callback: SendCallback,
    },
    /// Receive up to `len` bytes on a connected socket.
    Recv {
        socket: SOCKET,
        buf: *mut u8,
        len: u32,
        pending: bool,
        callback: RecvCallback,
    },
    /// Read from `fd` at `offset` into `buf[0..len]`. Synchronous in this
    /// backend; completes in the flush that first dispatches it.
    Read {
        fd: HANDLE,
        buf: *mut u8,
        len: u32,
        offset: u64,
        callback: ReadCallback,
    },
    /// Write `buf[0..len]` to `fd` at `offset`. Synchronous in this backend.
    Write {
        fd: HANDLE,
        buf: *const u8,
        len: u32,
        offset: u64,
        callback: WriteCallback,
    },
    /// Close a socket or kernel handle.
    Close { fd: HANDLE, callback: CloseCallback },
    /// Fire `callback` once `deadline_ns` (monotonic) has passed.
    Timeout {
        deadline_ns: u64,
        callback: TimeoutCallback,
    },
}

impl Operation {
    /// Returns `true` if this is an actual I/O operation (not [`Nop`](Self::Nop)).
    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(self, Operation::Nop)
    }
}

/// Tracks one submitted operation: intrusive link, kernel overlapped block,
/// user context, engine dispatch wrapper, and the operation payload.
///
/// Caller-owned. Create immediately before submitting, keep the storage
/// stable until the callback fires, release or reuse afterwards.
pub struct Completion {
    pub(crate) link: QueueLink<Completion, IoTag>,
    pub(crate) overlapped: Overlapped,
    pub(crate) context: *mut c_void,
    pub(crate) dispatch: Option<DispatchFn>,
    pub(crate) operation: Operation,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            link: QueueLink::new(),
            overlapped: Overlapped::new(),
            context: core::ptr::null_mut(),
            dispatch: None,
            operation: Operation::Nop,
        }
    }

    /// Returns `true` if the completion currently sits on one of the
    /// engine's queues (ready or timers).
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.link.is_linked()
    }

    /// Prepare this completion for a fresh submission.
    ///
    /// # Panics
    ///
    /// Panics if the completion is still linked in a queue.
    pub(crate) fn prepare(
        &mut self,
        context: *mut c_void,
        dispatch: DispatchFn,
        operation: Operation,
    ) {
        assert!(!self.link.is_linked(), "completion still queued");
        assert!(operation.is_active());

        let owner = self as *mut Completion;

        self.context = context;
        self.dispatch = Some(dispatch);
        self.operation = operation;
        self.overlapped.rearm(owner);
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueNode<IoTag> for Completion {
    fn queue_link(&mut self) -> &mut QueueLink<Self, IoTag> {
        &mut self.link
    }

    fn queue_link_ref(&self) -> &QueueLink<Self, IoTag> {
        &self.link
    }
}

/// Clamp a caller buffer length to what a single kernel transfer can carry.
#[inline]
pub(crate) fn buffer_limit(len: usize) -> u32 {
    len.min(BUFFER_LIMIT_MAX) as u32
}
