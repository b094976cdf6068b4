//! Typed error taxonomy for completion results.
//!
//! Each operation surfaces its own closed error set; raw OS codes that have
//! no dedicated meaning for the caller are carried in `Unexpected`.
//!
//! "Would block" is deliberately absent from every enum below: a pending
//! operation is an internal scheduling state (`Poll::Pending` in dispatch),
//! never a caller-visible outcome.
//!
//! Two mappings are definitions inherited from the surrounding system and
//! must not be "fixed": `recv` maps `WSAETIMEDOUT` and `WSAECONNABORTED` to
//! [`RecvError::ConnectionRefused`], and `WSAESHUTDOWN` to
//! [`RecvError::SocketNotConnected`].

use thiserror::Error;

use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_CRC, ERROR_DISK_FULL, ERROR_INVALID_HANDLE,
    ERROR_INVALID_PARAMETER, ERROR_IO_DEVICE, ERROR_NOT_ENOUGH_MEMORY, ERROR_NO_SYSTEM_RESOURCES,
    ERROR_SEEK_ON_DEVICE, ERROR_SEM_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    WSAEADDRNOTAVAIL, WSAEAFNOSUPPORT, WSAECONNABORTED, WSAECONNREFUSED, WSAECONNRESET,
    WSAEMFILE, WSAEMSGSIZE, WSAENETDOWN, WSAENETRESET, WSAENETUNREACH, WSAENOBUFS, WSAENOTCONN,
    WSAENOTSOCK, WSAEOPNOTSUPP, WSAESHUTDOWN, WSAETIMEDOUT,
};

/// Accept failures surfaced to the accept callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcceptError {
    #[error("connection aborted before the accept completed")]
    ConnectionAborted,
    #[error("descriptor is not a socket")]
    FileDescriptorNotASocket,
    #[error("socket does not support accepting connections")]
    OperationNotSupported,
    #[error("insufficient descriptors or kernel buffers")]
    SystemResources,
    #[error("updating the accepted socket's context failed (os error {0})")]
    SetSockOpt(i32),
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Connect failures surfaced to the connect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("local address not available")]
    AddressNotAvailable,
    #[error("address family not supported by this socket")]
    AddressFamilyNotSupported,
    #[error("connection refused by the remote host")]
    ConnectionRefused,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("insufficient kernel buffers")]
    SystemResources,
    #[error("connection attempt timed out")]
    ConnectionTimedOut,
    #[error("descriptor is not a socket")]
    FileDescriptorNotASocket,
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Send failures surfaced to the send callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("message larger than the transport allows")]
    MessageTooBig,
    #[error("network subsystem failed")]
    NetworkSubsystemFailed,
    #[error("insufficient kernel buffers")]
    SystemResources,
    #[error("descriptor is not a socket")]
    FileDescriptorNotASocket,
    #[error("socket already shut down for sending")]
    BrokenPipe,
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Receive failures surfaced to the recv callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("connection refused by the remote host")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("message larger than the receive buffer allows")]
    MessageTooBig,
    #[error("network subsystem failed")]
    NetworkSubsystemFailed,
    #[error("socket is not connected")]
    SocketNotConnected,
    #[error("insufficient kernel buffers")]
    SystemResources,
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Positional read failures surfaced to the read callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("descriptor not open for reading")]
    NotOpenForReading,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("buffer, length, or offset violates direct I/O alignment")]
    Alignment,
    #[error("device-level input/output error")]
    InputOutput,
    #[error("descriptor refers to a directory")]
    IsDir,
    #[error("insufficient memory or kernel resources")]
    SystemResources,
    #[error("descriptor does not support positional reads")]
    Unseekable,
    #[error("read timed out")]
    ConnectionTimedOut,
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Positional write failures surfaced to the write callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("descriptor not open for writing")]
    NotOpenForWriting,
    #[error("buffer, length, or offset violates direct I/O alignment")]
    Alignment,
    #[error("device-level input/output error")]
    InputOutput,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("insufficient memory or kernel resources")]
    SystemResources,
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Close failures surfaced to the close callback.
///
/// `DiskQuota`, `InputOutput`, and `NoSpaceLeft` exist for parity with
/// backends whose close can flush buffered state; this backend does not
/// produce them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseError {
    #[error("descriptor is invalid")]
    FileDescriptorInvalid,
    #[error("disk quota exceeded")]
    DiskQuota,
    #[error("device-level input/output error")]
    InputOutput,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Timer failures surfaced to the timeout callback.
///
/// `Canceled` is reserved: timers cannot be cancelled once submitted on this
/// backend, so the variant is never constructed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeoutError {
    #[error("timer canceled")]
    Canceled,
    #[error("unexpected os error {0}")]
    Unexpected(i32),
}

/// Map a Winsock error from a failed accept to its caller-visible kind.
pub(crate) fn accept_error(code: i32) -> AcceptError {
    match code {
        WSAECONNRESET => AcceptError::ConnectionAborted,
        WSAENOTSOCK => AcceptError::FileDescriptorNotASocket,
        WSAEOPNOTSUPP => AcceptError::OperationNotSupported,
        WSAEMFILE | WSAENOBUFS => AcceptError::SystemResources,
        _ => AcceptError::Unexpected(code),
    }
}

/// Map a Winsock error from a failed connect to its caller-visible kind.
pub(crate) fn connect_error(code: i32) -> ConnectError {
    match code {
        WSAEADDRNOTAVAIL => ConnectError::AddressNotAvailable,
        WSAEAFNOSUPPORT => ConnectError::AddressFamilyNotSupported,
        WSAECONNREFUSED => ConnectError::ConnectionRefused,
        WSAENETUNREACH => ConnectError::NetworkUnreachable,
        WSAENOBUFS => ConnectError::SystemResources,
        WSAETIMEDOUT => ConnectError::ConnectionTimedOut,
        WSAENOTSOCK => ConnectError::FileDescriptorNotASocket,
        _ => ConnectError::Unexpected(code),
    }
}

/// Map a Winsock error from a failed send to its caller-visible kind.
pub(crate) fn send_error(code: i32) -> SendError {
    match code {
        WSAECONNRESET | WSAENETRESET => SendError::ConnectionResetByPeer,
        WSAEMSGSIZE => SendError::MessageTooBig,
        WSAENETDOWN => SendError::NetworkSubsystemFailed,
        WSAENOBUFS => SendError::SystemResources,
        WSAENOTSOCK => SendError::FileDescriptorNotASocket,
        WSAESHUTDOWN => SendError::BrokenPipe,
        _ => SendError::Unexpected(code),
    }
}

/// Map a Winsock error from a failed recv to its caller-visible kind.
pub(crate) fn recv_error(code: i32) -> RecvError {
    match code {
        // Definitions, not accidents: see the module docs.
        WSAECONNREFUSED | WSAETIMEDOUT | WSAECONNABORTED => RecvError::ConnectionRefused,
        WSAECONNRESET | WSAENETRESET => RecvError::ConnectionResetByPeer,
        WSAEMSGSIZE => RecvError::MessageTooBig,
        WSAENETDOWN => RecvError::NetworkSubsystemFailed,
        WSAENOTCONN | WSAESHUTDOWN => RecvError::SocketNotConnected,
        WSAENOBUFS => RecvError::SystemResources,
        _ => RecvError::Unexpected(code),
    }
}

/// Map a Win32 error from a failed positional read to its caller-visible kind.
pub(crate) fn read_error(code: u32) -> ReadError {
    match code {
        ERROR_ACCESS_DENIED | ERROR_INVALID_HANDLE => ReadError::NotOpenForReading,
        ERROR_INVALID_PARAMETER => ReadError::Alignment,
        ERROR_IO_DEVICE | ERROR_CRC => ReadError::InputOutput,
        ERROR_NOT_ENOUGH_MEMORY | ERROR_NO_SYSTEM_RESOURCES => ReadError::SystemResources,
        ERROR_SEEK_ON_DEVICE => ReadError::Unseekable,
        ERROR_SEM_TIMEOUT => ReadError::ConnectionTimedOut,
        _ => ReadError::Unexpected(code as i32),
    }
}

/// Map a Win32 error from a failed positional write to its caller-visible kind.
pub(crate) fn write_error(code: u32) -> WriteError {
    match code {
        ERROR_ACCESS_DENIED | ERROR_INVALID_HANDLE => WriteError::NotOpenForWriting,
        ERROR_INVALID_PARAMETER => WriteError::Alignment,
        ERROR_IO_DEVICE | ERROR_CRC => WriteError::InputOutput,
        ERROR_DISK_FULL => WriteError::NoSpaceLeft,
        ERROR_NOT_ENOUGH_MEMORY | ERROR_NO_SYSTEM_RESOURCES => WriteError::SystemResources,
        _ => WriteError::Unexpected(code as i32),
    }
}

/// Map a Winsock error from a failed socket close to its caller-visible kind.
pub(crate) fn close_socket_error(code: i32) -> CloseError {
    match code {
        WSAENOTSOCK => CloseError::FileDescriptorInvalid,
        _ => CloseError::Unexpected(code),
    }
}

/// Map a Win32 error from a failed handle close to its caller-visible kind.
pub(crate) fn close_handle_error(code: u32) -> CloseError {
    match code {
        ERROR_INVALID_HANDLE => CloseError::FileDescriptorInvalid,
        _ => CloseError::Unexpected(code as i32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows_sys::Win32::Networking::WinSock::WSAEFAULT;

    #[test]
    fn accept_mapping() {
        assert_eq!(accept_error(WSAECONNRESET), AcceptError::ConnectionAborted);
        assert_eq!(
            accept_error(WSAENOTSOCK),
            AcceptError::FileDescriptorNotASocket
        );
        assert_eq!(
            accept_error(WSAEOPNOTSUPP),
            AcceptError::OperationNotSupported
        );
        assert_eq!(accept_error(WSAEMFILE), AcceptError::SystemResources);
        assert_eq!(accept_error(WSAENOBUFS), AcceptError::SystemResources);
        assert_eq!(accept_error(WSAEFAULT), AcceptError::Unexpected(WSAEFAULT));
    }

    #[test]
    fn connect_mapping() {
        assert_eq!(
            connect_error(WSAECONNREFUSED),
            ConnectError::ConnectionRefused
        );
        assert_eq!(
            connect_error(WSAENETUNREACH),
            ConnectError::NetworkUnreachable
        );
        assert_eq!(
            connect_error(WSAETIMEDOUT),
            ConnectError::ConnectionTimedOut
        );
        assert_eq!(
            connect_error(WSAEAFNOSUPPORT),
            ConnectError::AddressFamilyNotSupported
        );
    }

    #[test]
    fn recv_mapping_preserves_inherited_definitions() {
        // WSAETIMEDOUT and WSAECONNABORTED fold into ConnectionRefused;
        // WSAESHUTDOWN folds into SocketNotConnected. Definitions, not bugs.
        assert_eq!(recv_error(WSAETIMEDOUT), RecvError::ConnectionRefused);
        assert_eq!(recv_error(WSAECONNABORTED), RecvError::ConnectionRefused);
        assert_eq!(recv_error(WSAESHUTDOWN), RecvError::SocketNotConnected);
        assert_eq!(recv_error(WSAENOTCONN), RecvError::SocketNotConnected);
        assert_eq!(recv_error(WSAECONNRESET), RecvError::ConnectionResetByPeer);
    }

    #[test]
    fn send_mapping() {
        assert_eq!(send_error(WSAESHUTDOWN), SendError::BrokenPipe);
        assert_eq!(send_error(WSAECONNRESET), SendError::ConnectionResetByPeer);
        assert_eq!(send_error(WSAENETDOWN), SendError::NetworkSubsystemFailed);
        assert_eq!(send_error(WSAEMSGSIZE), SendError::MessageTooBig);
    }

    #[test]
    fn file_mapping() {
        assert_eq!(read_error(ERROR_INVALID_PARAMETER), ReadError::Alignment);
        assert_eq!(read_error(ERROR_SEEK_ON_DEVICE), ReadError::Unseekable);
        assert_eq!(write_error(ERROR_DISK_FULL), WriteError::NoSpaceLeft);
        assert_eq!(
            write_error(ERROR_INVALID_PARAMETER),
            WriteError::Alignment
        );
    }

    #[test]
    fn close_mapping() {
        assert_eq!(
            close_socket_error(WSAENOTSOCK),
            CloseError::FileDescriptorInvalid
        );
        assert_eq!(
            close_handle_error(ERROR_INVALID_HANDLE),
            CloseError::FileDescriptorInvalid
        );
    }

    #[test]
    fn displays_are_stable() {
        assert_eq!(
            AcceptError::ConnectionAborted.to_string(),
            "connection aborted before the accept completed"
        );
        assert_eq!(
            TimeoutError::Unexpected(5).to_string(),
            "unexpected os error 5"
        );
    }
}
