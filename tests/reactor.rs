//! End-to-end scenarios against the real kernel: loopback TCP echo,
//! durable file round-trip, and accept failure cleanup.

#![cfg(windows)]

use core::ffi::c_void;
use core::ptr::NonNull;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use squall::constants::SECTOR_SIZE;
use squall::io::{
    AcceptError, CloseError, Completion, ConnectError, Io, OpenMethod, ReadError, RecvError,
    SendError, WriteError,
};

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Networking::WinSock::{
    bind, closesocket, getsockname, listen, AF_INET, INVALID_SOCKET, IPPROTO_TCP, SOCKET,
    SOCKET_ERROR, SOCK_STREAM,
};

const SECTOR: usize = SECTOR_SIZE as usize;
const MS: u64 = 1_000_000;

/// Drives the engine in 1 ms blocking slices until `done` reports true.
fn drive(io: &mut Io, mut done: impl FnMut() -> bool) {
    // Each pass blocks for at most ~1 ms, so this bounds a test at ~5 s.
    for _ in 0..5_000 {
        if done() {
            return;
        }
        io.run_for_ns(MS).unwrap();
    }
    panic!("operation did not complete within the driver's time limit");
}

fn temp_data_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("squall-{}-{}.data", name, std::process::id()));
    path
}

/// One sector of sector-aligned heap memory. The data file is opened
/// unbuffered, which rejects transfers from ordinarily-aligned buffers.
struct SectorBlock {
    ptr: NonNull<u8>,
}

impl SectorBlock {
    fn layout() -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(SECTOR, SECTOR).unwrap()
    }

    fn zeroed() -> Self {
        // SAFETY: the layout has non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(Self::layout()) }).unwrap();
        assert!((ptr.as_ptr() as usize) % SECTOR == 0);
        Self { ptr }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: exclusively owned allocation of SECTOR bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), SECTOR) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), SECTOR) }
    }
}

impl Drop for SectorBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), Self::layout()) };
    }
}

/// A TCP listener on an ephemeral loopback port, registered with the port.
fn open_listener(io: &Io) -> (SOCKET, SocketAddr) {
    let socket = io
        .open_socket(AF_INET as i32, SOCK_STREAM as i32, IPPROTO_TCP as i32)
        .unwrap();

    let address: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
    let address = socket2::SockAddr::from(address);
    let bound = unsafe { bind(socket, address.as_ptr().cast(), address.len()) };
    assert!(bound != SOCKET_ERROR);

    let listening = unsafe { listen(socket, 1) };
    assert!(listening != SOCKET_ERROR);

    (socket, local_addr(socket))
}

fn local_addr(socket: SOCKET) -> SocketAddr {
    let ((), address) = unsafe {
        socket2::SockAddr::try_init(|storage, len| {
            if getsockname(socket, storage.cast(), len) == SOCKET_ERROR {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(())
            }
        })
    }
    .unwrap();
    address.as_socket().unwrap()
}

#[derive(Default)]
struct EchoState {
    accepted: Option<Result<SOCKET, AcceptError>>,
    connected: Option<Result<(), ConnectError>>,
    sent: Option<Result<usize, SendError>>,
    received: Option<Result<usize, RecvError>>,
    closed: u32,
}

unsafe fn on_accept(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<SOCKET, AcceptError>,
) {
    let state = unsafe { &mut *context.cast::<EchoState>() };
    assert!(state.accepted.is_none());
    state.accepted = Some(result);
}

unsafe fn on_connect(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<(), ConnectError>,
) {
    let state = unsafe { &mut *context.cast::<EchoState>() };
    assert!(state.connected.is_none());
    state.connected = Some(result);
}

unsafe fn on_send(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<usize, SendError>,
) {
    let state = unsafe { &mut *context.cast::<EchoState>() };
    assert!(state.sent.is_none());
    state.sent = Some(result);
}

unsafe fn on_recv(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<usize, RecvError>,
) {
    let state = unsafe { &mut *context.cast::<EchoState>() };
    assert!(state.received.is_none());
    state.received = Some(result);
}

unsafe fn on_close(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<(), CloseError>,
) {
    let state = unsafe { &mut *context.cast::<EchoState>() };
    assert!(result.is_ok());
    state.closed += 1;
}

#[test]
fn tcp_ping_over_loopback() {
    let mut io = Io::new(32, 0).unwrap();
    let mut state = EchoState::default();
    let state_ptr = (&mut state as *mut EchoState).cast::<c_void>();

    let (listener, listener_addr) = open_listener(&io);

    let mut accept_completion = Completion::new();
    io.accept(state_ptr, on_accept, &mut accept_completion, listener);

    let client = io
        .open_socket(AF_INET as i32, SOCK_STREAM as i32, IPPROTO_TCP as i32)
        .unwrap();
    let mut connect_completion = Completion::new();
    io.connect(
        state_ptr,
        on_connect,
        &mut connect_completion,
        client,
        listener_addr,
    );

    drive(&mut io, || state.accepted.is_some() && state.connected.is_some());

    state.connected.unwrap().unwrap();
    let server = state.accepted.unwrap().unwrap();
    assert!(server != INVALID_SOCKET);

    // Round-trip 4 bytes: the send reports 4, the recv delivers them intact.
    let message = *b"ping";
    let mut inbox = [0u8; 4];

    let mut send_completion = Completion::new();
    io.send(
        state_ptr,
        on_send,
        &mut send_completion,
        client,
        message.as_ptr(),
        message.len(),
    );

    let mut recv_completion = Completion::new();
    io.recv(
        state_ptr,
        on_recv,
        &mut recv_completion,
        server,
        inbox.as_mut_ptr(),
        inbox.len(),
    );

    drive(&mut io, || state.sent.is_some() && state.received.is_some());

    assert_eq!(state.sent.unwrap().unwrap(), 4);
    assert_eq!(state.received.unwrap().unwrap(), 4);
    assert_eq!(&inbox, b"ping");

    // Tear down every descriptor through the engine.
    let mut close_client = Completion::new();
    let mut close_server = Completion::new();
    let mut close_listener = Completion::new();
    io.close(state_ptr, on_close, &mut close_client, client as HANDLE);
    io.close(state_ptr, on_close, &mut close_server, server as HANDLE);
    io.close(state_ptr, on_close, &mut close_listener, listener as HANDLE);

    drive(&mut io, || state.closed == 3);
    assert!(io.is_idle());
}

#[test]
fn accept_failure_closes_cleanly() {
    let mut io = Io::new(32, 0).unwrap();
    let mut state = EchoState::default();
    let state_ptr = (&mut state as *mut EchoState).cast::<c_void>();

    let (listener, _listener_addr) = open_listener(&io);

    let mut accept_completion = Completion::new();
    io.accept(state_ptr, on_accept, &mut accept_completion, listener);

    // Let the accept reach the kernel, then yank the listener out from
    // under it.
    io.tick().unwrap();
    unsafe { closesocket(listener) };

    drive(&mut io, || state.accepted.is_some());

    // A terminal, mapped error: never a would-block sentinel, and the
    // engine is quiescent afterwards (the internal endpoint socket was
    // closed by the state machine).
    assert!(state.accepted.unwrap().is_err());
    assert!(io.is_idle());
}

#[derive(Default)]
struct FileState {
    written: Option<Result<usize, WriteError>>,
    read: Option<Result<usize, ReadError>>,
    closed: u32,
}

unsafe fn on_file_write(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<usize, WriteError>,
) {
    let state = unsafe { &mut *context.cast::<FileState>() };
    assert!(state.written.is_none());
    state.written = Some(result);
}

unsafe fn on_file_read(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<usize, ReadError>,
) {
    let state = unsafe { &mut *context.cast::<FileState>() };
    assert!(state.read.is_none());
    state.read = Some(result);
}

unsafe fn on_file_close(
    context: *mut c_void,
    _io: &mut Io,
    _completion: &mut Completion,
    result: Result<(), CloseError>,
) {
    let state = unsafe { &mut *context.cast::<FileState>() };
    assert!(result.is_ok());
    state.closed += 1;
}

#[test]
fn file_write_survives_reopen() {
    let mut io = Io::new(32, 0).unwrap();
    let mut state = FileState::default();
    let state_ptr = (&mut state as *mut FileState).cast::<c_void>();

    let path = temp_data_path("durability");
    std::fs::remove_file(&path).ok();

    let dir = io.open_dir(&std::env::temp_dir()).unwrap();
    let size = 4 * SECTOR as u64;

    let fd = io
        .open_file(dir, &path, size, OpenMethod::Create, true)
        .unwrap();

    // The durability contract holds before any explicit write.
    assert!(std::fs::metadata(&path).unwrap().len() >= size);

    let mut sector = SectorBlock::zeroed();
    sector.bytes_mut().fill(0xAB);

    let mut write_completion = Completion::new();
    io.write(
        state_ptr,
        on_file_write,
        &mut write_completion,
        fd,
        sector.bytes().as_ptr(),
        SECTOR,
        0,
    );
    drive(&mut io, || state.written.is_some());
    assert_eq!(state.written.unwrap().unwrap(), SECTOR);

    let mut close_completion = Completion::new();
    io.close(state_ptr, on_file_close, &mut close_completion, fd);
    drive(&mut io, || state.closed == 1);

    // Reopen and read the sector back: contents must match exactly.
    let fd = io
        .open_file(dir, &path, size, OpenMethod::Open, true)
        .unwrap();

    let mut inbox = SectorBlock::zeroed();
    let mut read_completion = Completion::new();
    io.read(
        state_ptr,
        on_file_read,
        &mut read_completion,
        fd,
        inbox.bytes_mut().as_mut_ptr(),
        SECTOR,
        0,
    );
    drive(&mut io, || state.read.is_some());
    assert_eq!(state.read.unwrap().unwrap(), SECTOR);
    assert!(inbox.bytes().iter().all(|&b| b == 0xAB));

    let mut close_completion = Completion::new();
    io.close(state_ptr, on_file_close, &mut close_completion, fd);
    let mut close_dir_completion = Completion::new();
    io.close(state_ptr, on_file_close, &mut close_dir_completion, dir);
    drive(&mut io, || state.closed == 3);

    assert!(io.is_idle());
    std::fs::remove_file(&path).ok();
}

#[test]
fn create_or_open_falls_back_and_reopens() {
    let mut io = Io::new(32, 0).unwrap();
    let mut state = FileState::default();
    let state_ptr = (&mut state as *mut FileState).cast::<c_void>();

    let path = temp_data_path("create-or-open");
    std::fs::remove_file(&path).ok();

    let size = 2 * SECTOR as u64;

    // First call creates.
    let fd = io
        .open_file(0, &path, size, OpenMethod::CreateOrOpen, true)
        .unwrap();
    let mut close_completion = Completion::new();
    io.close(state_ptr, on_file_close, &mut close_completion, fd);
    drive(&mut io, || state.closed == 1);

    // Second call opens the existing file.
    let fd = io
        .open_file(0, &path, size, OpenMethod::CreateOrOpen, true)
        .unwrap();
    let mut close_completion = Completion::new();
    io.close(state_ptr, on_file_close, &mut close_completion, fd);
    drive(&mut io, || state.closed == 2);

    assert!(io.is_idle());
    std::fs::remove_file(&path).ok();
}
