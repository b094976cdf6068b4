//! Per-operation state machines: submit→start→poll→classify against the
//! Winsock and kernel APIs.
//!
//! Every operation is driven by a dispatch wrapper that the flush cycle
//! re-enters each time the completion becomes ready. The wrapper calls the
//! op's `do_*` function and classifies the outcome:
//!
//! - `Poll::Pending`: the kernel now owns the operation; `io_pending` is
//!   incremented and the user callback does not fire. The completion port
//!   will re-deliver the completion later.
//! - `Poll::Ready(result)`: terminal; the typed user callback fires exactly
//!   once with `result`.
//!
//! Sockets are opened with `FILE_SKIP_COMPLETION_PORT_ON_SUCCESS`, so an
//! inline success means no packet will follow: the wrapper must report the
//! transferred bytes immediately and must not mark the op pending.

use core::ffi::c_void;
use core::ptr::{null, null_mut, NonNull};
use core::task::Poll;

use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_HANDLE_EOF, HANDLE,
};
use windows_sys::Win32::Networking::WinSock::{
    bind, closesocket, getsockname, getsockopt, setsockopt, AcceptEx, WSAGetLastError,
    WSAGetOverlappedResult, WSAIoctl, WSARecv, WSASend, AF_INET, AF_INET6, INVALID_SOCKET,
    IPPROTO_TCP, LPFN_CONNECTEX, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR_STORAGE, SOCKET,
    SOCKET_ERROR, SOCK_STREAM, SOL_SOCKET, SO_ERROR, SO_UPDATE_ACCEPT_CONTEXT,
    SO_UPDATE_CONNECT_CONTEXT, WSABUF, WSAEAFNOSUPPORT, WSAEINVAL, WSAENOTSOCK, WSAEOPNOTSUPP,
    WSAID_CONNECTEX, WSA_IO_INCOMPLETE, WSA_IO_PENDING,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::OVERLAPPED;

use super::error::{self, AcceptError, CloseError, ConnectError, ReadError, RecvError, SendError};
use super::reactor::Io;
use super::{Completion, Operation};

/// Stamps out a dispatch wrapper for one operation variant.
///
/// The closed set of variants is known at compile time, so each wrapper is
/// monomorphized over its `do_*` function and its typed callback; the flush
/// cycle only ever sees the uniform `DispatchFn` shape.
macro_rules! dispatch {
    ($name:ident, $drive:ident, $variant:ident) => {
        pub(crate) unsafe fn $name(io: &mut Io, mut ptr: NonNull<Completion>) {
            // SAFETY: dispatch contract: a live, unlinked completion on the
            // engine thread.
            let completion = unsafe { ptr.as_mut() };

            match unsafe { $drive(io, completion) } {
                Poll::Pending => io.note_pending(),
                Poll::Ready(result) => {
                    let callback = match &completion.operation {
                        Operation::$variant { callback, .. } => *callback,
                        _ => unreachable!("dispatch wrapper bound to the wrong operation"),
                    };
                    let context = completion.context;
                    // SAFETY: the caller supplied `callback` and `context`
                    // together at submission.
                    unsafe { callback(context, io, completion, result) };
                }
            }
        }
    };
}

dispatch!(dispatch_accept, do_accept, Accept);
dispatch!(dispatch_connect, do_connect, Connect);
dispatch!(dispatch_send, do_send, Send);
dispatch!(dispatch_recv, do_recv, Recv);
dispatch!(dispatch_read, do_read, Read);
dispatch!(dispatch_write, do_write, Write);
dispatch!(dispatch_close, do_close, Close);
dispatch!(dispatch_timeout, do_timeout, Timeout);

/// Dual-address length handed to the kernel for each of the two addresses
/// the accept path writes: the address itself plus 16 bytes of padding.
const ACCEPT_ADDRESS_LEN: u32 = (size_of::<SOCKADDR_STORAGE>() + 16) as u32;

/// Accept: two states, distinguished by `client_socket`.
///
/// First entry creates the endpoint socket (same family as the listener,
/// already associated with the port) and issues the overlapped accept.
/// Subsequent entries poll the overlapped result. Any terminal failure
/// closes and invalidates the endpoint socket before surfacing the error.
unsafe fn do_accept(
    io: &mut Io,
    completion: &mut Completion,
) -> Poll<Result<SOCKET, AcceptError>> {
    let Completion {
        overlapped,
        operation,
        ..
    } = completion;
    let Operation::Accept {
        listen_socket,
        client_socket,
        address_buffer,
        ..
    } = operation
    else {
        unreachable!("accept dispatch on a non-accept operation");
    };

    if *client_socket == INVALID_SOCKET {
        let family = match socket_family(*listen_socket) {
            Ok(family) => family,
            Err(code) => return Poll::Ready(Err(error::accept_error(code))),
        };
        let socket = match io.open_socket(family as i32, SOCK_STREAM as i32, IPPROTO_TCP as i32)
        {
            Ok(socket) => socket,
            Err(err) => {
                let code = err.raw_os_error().unwrap_or(0);
                return Poll::Ready(Err(error::accept_error(code)));
            }
        };
        *client_socket = socket;

        let mut received: u32 = 0;
        // SAFETY: `address_buffer` and `overlapped` are embedded in the
        // completion, which stays valid and immovable until the callback.
        let ok = unsafe {
            AcceptEx(
                *listen_socket,
                socket,
                address_buffer.as_mut_ptr().cast(),
                0,
                ACCEPT_ADDRESS_LEN,
                ACCEPT_ADDRESS_LEN,
                &mut received,
                &mut overlapped.raw,
            )
        };
        if ok != 0 {
            // Inline success: no packet follows on this port.
            return Poll::Ready(finish_accept(*listen_socket, client_socket));
        }

        // SAFETY: immediately after the failed call on this thread.
        match unsafe { WSAGetLastError() } {
            WSA_IO_PENDING => Poll::Pending,
            code => {
                abort_accept(client_socket);
                Poll::Ready(Err(error::accept_error(code)))
            }
        }
    } else {
        // The port re-delivered this completion: poll without waiting.
        let mut transferred: u32 = 0;
        let mut flags: u32 = 0;
        // SAFETY: the overlapped belongs to this completion and the accept
        // was issued on `listen_socket`.
        let ok = unsafe {
            WSAGetOverlappedResult(
                *listen_socket,
                &overlapped.raw,
                &mut transferred,
                0,
                &mut flags,
            )
        };
        if ok != 0 {
            return Poll::Ready(finish_accept(*listen_socket, client_socket));
        }

        // SAFETY: as above.
        match unsafe { WSAGetLastError() } {
            WSA_IO_INCOMPLETE => Poll::Pending,
            code => {
                abort_accept(client_socket);
                Poll::Ready(Err(error::accept_error(code)))
            }
        }
    }
}

/// Success tail of the accept state machine: propagate the listener context
/// to the accepted socket, then transfer ownership to the caller.
fn finish_accept(
    listen_socket: SOCKET,
    client_socket: &mut SOCKET,
) -> Result<SOCKET, AcceptError> {
    let socket = *client_socket;
    assert!(socket != INVALID_SOCKET);

    // SAFETY: both sockets are live; the option value is read before return.
    let ok = unsafe {
        setsockopt(
            socket,
            SOL_SOCKET,
            SO_UPDATE_ACCEPT_CONTEXT,
            (&listen_socket as *const SOCKET).cast(),
            size_of::<SOCKET>() as i32,
        )
    };
    if ok == SOCKET_ERROR {
        // SAFETY: immediately after the failed call on this thread.
        let code = unsafe { WSAGetLastError() };
        abort_accept(client_socket);
        return Err(AcceptError::SetSockOpt(code));
    }

    // Ownership transfers to the caller.
    *client_socket = INVALID_SOCKET;
    Ok(socket)
}

/// Failure tail of the accept state machine: the endpoint socket was never
/// handed to the caller, so it is closed here.
fn abort_accept(client_socket: &mut SOCKET) {
    if *client_socket != INVALID_SOCKET {
        // SAFETY: the socket was created by this state machine and is not
        // visible to the caller.
        unsafe { closesocket(*client_socket) };
        *client_socket = INVALID_SOCKET;
    }
}

/// Address family of a bound socket, via `getsockname`.
fn socket_family(socket: SOCKET) -> Result<u16, i32> {
    // SAFETY: zeroed SOCKADDR_STORAGE is a valid out-buffer.
    let mut storage: SOCKADDR_STORAGE = unsafe { core::mem::zeroed() };
    let mut len = size_of::<SOCKADDR_STORAGE>() as i32;

    // SAFETY: `storage` and `len` live across the call.
    let ok = unsafe {
        getsockname(
            socket,
            (&mut storage as *mut SOCKADDR_STORAGE).cast(),
            &mut len,
        )
    };
    if ok == SOCKET_ERROR {
        // SAFETY: immediately after the failed call on this thread.
        return Err(unsafe { WSAGetLastError() });
    }

    Ok(storage.ss_family)
}

/// Connect: two states, distinguished by `pending`.
///
/// First entry binds the socket (`ConnectEx` requires it), resolves the
/// extension pointer, and starts the connect. Subsequent entries poll the
/// overlapped result.
unsafe fn do_connect(
    io: &mut Io,
    completion: &mut Completion,
) -> Poll<Result<(), ConnectError>> {
    let Completion {
        overlapped,
        operation,
        ..
    } = completion;
    let Operation::Connect {
        socket,
        address,
        pending,
        ..
    } = operation
    else {
        unreachable!("connect dispatch on a non-connect operation");
    };

    if !*pending {
        if let Err(code) = bind_wildcard(*socket, address.family()) {
            return Poll::Ready(Err(error::connect_error(code)));
        }

        let connect_fn = match lookup_connect_ex(io, *socket) {
            Ok(function) => function,
            Err(code) => return Poll::Ready(Err(error::connect_error(code))),
        };

        *pending = true;

        let mut sent: u32 = 0;
        // SAFETY: `address` and `overlapped` are embedded in the completion,
        // which stays valid and immovable until the callback.
        let ok = unsafe {
            connect_fn(
                *socket,
                address.as_ptr().cast(),
                address.len(),
                null(),
                0,
                &mut sent,
                &mut overlapped.raw,
            )
        };
        if ok != 0 {
            // Inline success: no packet follows on this port.
            return Poll::Ready(finish_connect(*socket));
        }

        // SAFETY: immediately after the failed call on this thread.
        match unsafe { WSAGetLastError() } {
            WSA_IO_PENDING => Poll::Pending,
            code => Poll::Ready(Err(error::connect_error(code))),
        }
    } else {
        let mut transferred: u32 = 0;
        let mut flags: u32 = 0;
        // SAFETY: the overlapped belongs to this completion and the connect
        // was issued on `socket`.
        let ok = unsafe {
            WSAGetOverlappedResult(*socket, &overlapped.raw, &mut transferred, 0, &mut flags)
        };
        if ok != 0 {
            return Poll::Ready(finish_connect(*socket));
        }

        // SAFETY: as above.
        match unsafe { WSAGetLastError() } {
            WSA_IO_INCOMPLETE => Poll::Pending,
            code => Poll::Ready(Err(error::connect_error(code))),
        }
    }
}

/// Success tail of the connect state machine.
fn finish_connect(socket: SOCKET) -> Result<(), ConnectError> {
    // SAFETY: the socket is live; SO_UPDATE_CONNECT_CONTEXT takes no value.
    let ok = unsafe { setsockopt(socket, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, null(), 0) };
    if ok == SOCKET_ERROR {
        // SAFETY: immediately after the failed call on this thread.
        let code = unsafe { WSAGetLastError() };
        return Err(error::connect_error(code));
    }
    Ok(())
}

/// `ConnectEx` demands an initially bound socket; bind to the wildcard
/// address of the target's family. An already-bound socket is acceptable.
fn bind_wildcard(socket: SOCKET, family: u16) -> Result<(), i32> {
    let wildcard: std::net::SocketAddr = if family as i32 == AF_INET as i32 {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else if family as i32 == AF_INET6 as i32 {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        return Err(WSAEAFNOSUPPORT);
    };
    let wildcard = socket2::SockAddr::from(wildcard);

    // SAFETY: the sockaddr storage lives across the call.
    let ok = unsafe { bind(socket, wildcard.as_ptr().cast(), wildcard.len()) };
    if ok == SOCKET_ERROR {
        // SAFETY: immediately after the failed call on this thread.
        let code = unsafe { WSAGetLastError() };
        // WSAEINVAL: already bound, which is all ConnectEx needs.
        if code != WSAEINVAL {
            return Err(code);
        }
    }
    Ok(())
}

/// The function type behind `LPFN_CONNECTEX`.
type ConnectExFn = unsafe extern "system" fn(
    s: SOCKET,
    name: *const windows_sys::Win32::Networking::WinSock::SOCKADDR,
    namelen: i32,
    lpsendbuffer: *const c_void,
    dwsenddatalength: u32,
    lpdwbytessent: *mut u32,
    lpoverlapped: *mut OVERLAPPED,
) -> i32;

/// Resolve `ConnectEx` through `WSAIoctl`, caching the pointer on the
/// reactor after the first successful lookup.
fn lookup_connect_ex(io: &mut Io, socket: SOCKET) -> Result<ConnectExFn, i32> {
    if let Some(function) = io.connect_ex {
        return Ok(function);
    }

    let guid: GUID = WSAID_CONNECTEX;
    let mut function: LPFN_CONNECTEX = None;
    let mut returned: u32 = 0;

    // SAFETY: in/out buffers live across the call; the kernel writes a
    // function pointer of exactly `LPFN_CONNECTEX` size.
    let ok = unsafe {
        WSAIoctl(
            socket,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            (&guid as *const GUID).cast(),
            size_of::<GUID>() as u32,
            (&mut function as *mut LPFN_CONNECTEX).cast(),
            size_of::<LPFN_CONNECTEX>() as u32,
            &mut returned,
            null_mut(),
            None,
        )
    };
    if ok == SOCKET_ERROR {
        // SAFETY: immediately after the failed call on this thread.
        return Err(unsafe { WSAGetLastError() });
    }

    let function = function.ok_or(WSAEOPNOTSUPP)?;
    io.connect_ex = Some(function);
    Ok(function)
}

/// Send: two states, distinguished by `pending`. Single-buffer `WSASend`.
unsafe fn do_send(
    _io: &mut Io,
    completion: &mut Completion,
) -> Poll<Result<usize, SendError>> {
    let Completion {
        overlapped,
        operation,
        ..
    } = completion;
    let Operation::Send {
        socket,
        buf,
        len,
        pending,
        ..
    } = operation
    else {
        unreachable!("send dispatch on a non-send operation");
    };

    if !*pending {
        *pending = true;

        let wsabuf = WSABUF {
            len: *len,
            buf: (*buf).cast_mut(),
        };
        let mut transferred: u32 = 0;
        // SAFETY: the caller keeps `buf` valid for the operation's lifetime;
        // `overlapped` is embedded in the immovable completion.
        let ok = unsafe {
            WSASend(
                *socket,
                &wsabuf,
                1,
                &mut transferred,
                0,
                &mut overlapped.raw,
                None,
            )
        };
        if ok == 0 {
            // Inline success: no packet follows on this port.
            return Poll::Ready(Ok(transferred as usize));
        }

        // SAFETY: immediately after the failed call on this thread.
        match unsafe { WSAGetLastError() } {
            WSA_IO_PENDING => Poll::Pending,
            code => Poll::Ready(Err(error::send_error(code))),
        }
    } else {
        let mut transferred: u32 = 0;
        let mut flags: u32 = 0;
        // SAFETY: the overlapped belongs to this completion.
        let ok = unsafe {
            WSAGetOverlappedResult(*socket, &overlapped.raw, &mut transferred, 0, &mut flags)
        };
        if ok != 0 {
            return Poll::Ready(Ok(transferred as usize));
        }

        // SAFETY: as above.
        match unsafe { WSAGetLastError() } {
            WSA_IO_INCOMPLETE => Poll::Pending,
            code => Poll::Ready(Err(error::send_error(code))),
        }
    }
}

/// Recv: mirror of [`do_send`] over `WSARecv`.
unsafe fn do_recv(
    _io: &mut Io,
    completion: &mut Completion,
) -> Poll<Result<usize, RecvError>> {
    let Completion {
        overlapped,
        operation,
        ..
    } = completion;
    let Operation::Recv {
        socket,
        buf,
        len,
        pending,
        ..
    } = operation
    else {
        unreachable!("recv dispatch on a non-recv operation");
    };

    if !*pending {
        *pending = true;

        let wsabuf = WSABUF {
            len: *len,
            buf: *buf,
        };
        let mut transferred: u32 = 0;
        let mut flags: u32 = 0;
        // SAFETY: the caller keeps `buf` valid for the operation's lifetime;
        // `overlapped` is embedded in the immovable completion.
        let ok = unsafe {
            WSARecv(
                *socket,
                &wsabuf,
                1,
                &mut transferred,
                &mut flags,
                &mut overlapped.raw,
                None,
            )
        };
        if ok == 0 {
            // Inline success: no packet follows on this port.
            return Poll::Ready(Ok(transferred as usize));
        }

        // SAFETY: immediately after the failed call on this thread.
        match unsafe { WSAGetLastError() } {
            WSA_IO_PENDING => Poll::Pending,
            code => Poll::Ready(Err(error::recv_error(code))),
        }
    } else {
        let mut transferred: u32 = 0;
        let mut flags: u32 = 0;
        // SAFETY: the overlapped belongs to this completion.
        let ok = unsafe {
            WSAGetOverlappedResult(*socket, &overlapped.raw, &mut transferred, 0, &mut flags)
        };
        if ok != 0 {
            return Poll::Ready(Ok(transferred as usize));
        }

        // SAFETY: as above.
        match unsafe { WSAGetLastError() } {
            WSA_IO_INCOMPLETE => Poll::Pending,
            code => Poll::Ready(Err(error::recv_error(code))),
        }
    }
}

/// Positional read. Synchronous in this backend: the handle is opened
/// without overlapped mode, so `ReadFile` with an offset-carrying local
/// `OVERLAPPED` blocks until the transfer finishes. Never returns
/// `Poll::Pending`.
unsafe fn do_read(
    _io: &mut Io,
    completion: &mut Completion,
) -> Poll<Result<usize, ReadError>> {
    let (fd, buf, len, offset) = match &completion.operation {
        Operation::Read {
            fd, buf, len, offset, ..
        } => (*fd, *buf, *len, *offset),
        _ => unreachable!("read dispatch on a non-read operation"),
    };

    let mut positioned = positioned_overlapped(offset);
    let mut transferred: u32 = 0;
    // SAFETY: the caller keeps `buf` valid for `len` bytes; `positioned`
    // lives across this (synchronous) call.
    let ok = unsafe { ReadFile(fd, buf.cast(), len, &mut transferred, &mut positioned) };
    if ok != 0 {
        return Poll::Ready(Ok(transferred as usize));
    }

    // SAFETY: immediately after the failed call on this thread.
    match unsafe { GetLastError() } {
        // Reading at or past the end of file: zero bytes, not an error.
        ERROR_HANDLE_EOF => Poll::Ready(Ok(transferred as usize)),
        code => Poll::Ready(Err(error::read_error(code))),
    }
}

/// Positional write. Synchronous, like [`do_read`].
unsafe fn do_write(
    _io: &mut Io,
    completion: &mut Completion,
) -> Poll<Result<usize, super::WriteError>> {
    let (fd, buf, len, offset) = match &completion.operation {
        Operation::Write {
            fd, buf, len, offset, ..
        } => (*fd, *buf, *len, *offset),
        _ => unreachable!("write dispatch on a non-write operation"),
    };

    let mut positioned = positioned_overlapped(offset);
    let mut transferred: u32 = 0;
    // SAFETY: the caller keeps `buf` valid for `len` bytes; `positioned`
    // lives across this (synchronous) call.
    let ok = unsafe { WriteFile(fd, buf.cast(), len, &mut transferred, &mut positioned) };
    if ok != 0 {
        return Poll::Ready(Ok(transferred as usize));
    }

    // SAFETY: immediately after the failed call on this thread.
    Poll::Ready(Err(error::write_error(unsafe { GetLastError() })))
}

/// An `OVERLAPPED` used purely to carry a file offset for synchronous
/// positional I/O.
pub(crate) fn positioned_overlapped(offset: u64) -> OVERLAPPED {
    // SAFETY: all-zero is the documented initial state.
    let mut overlapped: OVERLAPPED = unsafe { core::mem::zeroed() };
    overlapped.Anonymous.Anonymous.Offset = offset as u32;
    overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
    overlapped
}

/// Close: a socket closes as a socket, anything else as a kernel handle.
/// The probe is a harmless `getsockopt`; `WSAENOTSOCK` identifies handles.
/// Completes inline.
unsafe fn do_close(
    _io: &mut Io,
    completion: &mut Completion,
) -> Poll<Result<(), CloseError>> {
    let fd: HANDLE = match &completion.operation {
        Operation::Close { fd, .. } => *fd,
        _ => unreachable!("close dispatch on a non-close operation"),
    };

    let socket = fd as SOCKET;
    let mut so_error: i32 = 0;
    let mut len = size_of::<i32>() as i32;
    // SAFETY: out-buffers live across the call; the probe does not mutate
    // socket state.
    let probed = unsafe {
        getsockopt(
            socket,
            SOL_SOCKET,
            SO_ERROR,
            (&mut so_error as *mut i32).cast(),
            &mut len,
        )
    };

    // SAFETY (both arms): the caller owns `fd` and relinquishes it here.
    if probed == SOCKET_ERROR && unsafe { WSAGetLastError() } == WSAENOTSOCK {
        let ok = unsafe { CloseHandle(fd) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            return Poll::Ready(Err(error::close_handle_error(code)));
        }
    } else {
        let ok = unsafe { closesocket(socket) };
        if ok == SOCKET_ERROR {
            let code = unsafe { WSAGetLastError() };
            return Poll::Ready(Err(error::close_socket_error(code)));
        }
    }

    Poll::Ready(Ok(()))
}

/// Timers carry no kernel state: by the time the flush delivers one, its
/// deadline has passed (or it took the zero fast path). `Canceled` is
/// unreachable on this backend.
unsafe fn do_timeout(
    _io: &mut Io,
    _completion: &mut Completion,
) -> Poll<Result<(), super::TimeoutError>> {
    Poll::Ready(Ok(()))
}
