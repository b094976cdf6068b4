//! The engine instance: submission entries, the flush cycle, and the timer
//! list.
//!
//! Single-threaded and cooperative. Every submit entry, every flush, and
//! every callback runs on the one thread that owns the [`Io`]; the only
//! cross-thread interaction is the kernel posting packets to the completion
//! port, which is inherent to that mechanism.

use core::ffi::c_void;
use core::ptr::NonNull;
use std::io;
use std::time::Instant;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    LPFN_CONNECTEX, WSACleanup, WSADATA, WSAStartup, INVALID_SOCKET, SOCKET,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED_ENTRY,
};

use crate::constants::{IO_ENTRIES_PER_FLUSH, NS_PER_MS};
use crate::stdx::Queue;

use super::ops;
use super::{
    buffer_limit, AcceptCallback, CloseCallback, Completion, ConnectCallback, DispatchFn, IoTag,
    Operation, Overlapped, ReadCallback, RecvCallback, SendCallback, TimeoutCallback,
    TimeoutError, WriteCallback, ACCEPT_ADDRESS_BUFFER_LEN,
};

/// Flush behavior: whether the completion-port wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Wait up to the next timer deadline. Requires an armed timer when
    /// kernel-pending work exists; an unbounded wait is a programmer error.
    Blocking,
    /// Poll the port with a zero timeout.
    NonBlocking,
}

/// The reactor. One per event-loop thread.
///
/// Owns the completion port and the two intrusive queues: `timeouts` (armed
/// timers, FIFO by submission) and `completed` (operations ready to have
/// their dispatch wrapper invoked, FIFO).
///
/// # Invariants
///
/// - `iocp` is valid between `new` and drop.
/// - `io_pending` equals the number of operations currently owned by the
///   kernel; it never underflows.
/// - A completion is on at most one of `timeouts`/`completed` at any
///   instant, tracked by its single intrusive link.
/// - Must be quiescent (no pending ops, empty queues) before drop.
pub struct Io {
    pub(crate) iocp: HANDLE,
    clock_origin: Instant,
    pub(crate) io_pending: u32,
    timeouts: Queue<Completion, IoTag>,
    completed: Queue<Completion, IoTag>,
    /// `ConnectEx` is reached through a function pointer looked up at
    /// runtime; cached here after the first successful lookup.
    pub(crate) connect_ex: LPFN_CONNECTEX,
}

impl Io {
    /// Creates the reactor: starts Winsock 2.2 and opens the completion
    /// port.
    ///
    /// `entries` and `flags` are sizing hints shared with sibling backends;
    /// the completion port sizes itself, so they are only validated for
    /// plausibility here.
    ///
    /// # Errors
    ///
    /// Propagates Winsock startup and port creation failures. Winsock is
    /// torn down again if the port cannot be created.
    pub fn new(entries: u32, _flags: u32) -> io::Result<Self> {
        assert!(entries > 0);

        winsock_startup()?;

        // SAFETY: INVALID_HANDLE_VALUE with no existing port means
        // "create a new port"; a concurrency hint of 1 matches the
        // single-threaded drain.
        let iocp =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0 as HANDLE, 0, 1) };
        if iocp == 0 {
            let err = io::Error::last_os_error();
            // SAFETY: paired with the successful WSAStartup above.
            unsafe { WSACleanup() };
            return Err(err);
        }

        log::debug!(target: "squall::io", "reactor initialized");

        Ok(Self {
            iocp,
            clock_origin: Instant::now(),
            io_pending: 0,
            timeouts: Queue::init(),
            completed: Queue::init(),
            connect_ex: None,
        })
    }

    /// Nanoseconds since the reactor was created. Monotonic, non-decreasing.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.clock_origin.elapsed().as_nanos() as u64
    }

    /// Returns `true` if no operation is kernel-pending and both queues are
    /// empty.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.io_pending == 0 && self.timeouts.is_empty() && self.completed.is_empty()
    }

    /// Performs one non-blocking flush cycle: expire timers, poll the port,
    /// deliver ready callbacks.
    ///
    /// # Errors
    ///
    /// Propagates fatal completion-port errors.
    pub fn tick(&mut self) -> io::Result<()> {
        self.flush(Mode::NonBlocking)
    }

    /// Blocks in flush cycles until at least `nanoseconds` have passed.
    ///
    /// Returns no earlier than the requested duration and promptly
    /// thereafter (bounded by the 1 ms port-wait rounding). Other submitted
    /// operations keep completing while this runs.
    pub fn run_for_ns(&mut self, nanoseconds: u64) -> io::Result<()> {
        assert!(nanoseconds < 1 << 63);

        unsafe fn on_expire(
            context: *mut c_void,
            _io: &mut Io,
            _completion: &mut Completion,
            result: Result<(), TimeoutError>,
        ) {
            assert!(result.is_ok());
            // SAFETY: context points at the `expired` flag below, which
            // outlives the enclosing loop.
            unsafe { *context.cast::<bool>() = true };
        }

        let mut expired = false;
        let mut completion = Completion::new();
        self.timeout(
            (&mut expired as *mut bool).cast::<c_void>(),
            on_expire,
            &mut completion,
            nanoseconds,
        );

        while !expired {
            self.flush(Mode::Blocking)?;
        }

        assert!(!completion.is_queued());
        Ok(())
    }

    /// One flush cycle.
    ///
    /// 1. If nothing is ready, expire timers and learn the next deadline.
    /// 2. If kernel work is pending and still nothing is ready, poll the
    ///    port (bounded by the deadline in blocking mode, zero otherwise).
    /// 3. Snapshot the ready queue, then invoke each dispatch wrapper.
    ///
    /// The snapshot is mandatory: callbacks are free to submit further
    /// operations, and those must become eligible no earlier than the next
    /// flush.
    fn flush(&mut self, mode: Mode) -> io::Result<()> {
        if self.completed.is_empty() {
            let min_timeout_ns = self.flush_timeouts();

            if self.io_pending > 0 && self.completed.is_empty() {
                let timeout_ms = match mode {
                    Mode::NonBlocking => 0,
                    Mode::Blocking => {
                        let ns = min_timeout_ns
                            .expect("blocking flush requires an armed timer to bound the wait");
                        timeout_to_ms(ns)
                    }
                };

                // SAFETY: an all-zero OVERLAPPED_ENTRY array is a valid
                // out-buffer for the harvest below.
                let mut entries: [OVERLAPPED_ENTRY; IO_ENTRIES_PER_FLUSH] =
                    unsafe { core::mem::zeroed() };
                let mut removed: u32 = 0;

                // SAFETY: `iocp` is valid between new and drop; `entries`
                // and `removed` live across the call.
                let ok = unsafe {
                    GetQueuedCompletionStatusEx(
                        self.iocp,
                        entries.as_mut_ptr(),
                        entries.len() as u32,
                        &mut removed,
                        timeout_ms,
                        0,
                    )
                };
                if ok == 0 {
                    // SAFETY: immediately after the failed call on this thread.
                    let code = unsafe { GetLastError() };
                    if code != WAIT_TIMEOUT {
                        return Err(io::Error::from_raw_os_error(code as i32));
                    }
                    // Timeout expired: zero entries harvested.
                    removed = 0;
                }

                assert!(removed as usize <= entries.len());
                assert!(
                    removed <= self.io_pending,
                    "harvested more completions than were kernel-pending"
                );
                self.io_pending -= removed;

                for entry in entries.iter().take(removed as usize) {
                    // SAFETY: every packet on this port stems from one of
                    // our submissions, so the overlapped belongs to a live
                    // completion.
                    let mut ptr = unsafe { Overlapped::completion_of(entry.lpOverlapped) };
                    let completion = unsafe { ptr.as_mut() };
                    assert!(completion.operation.is_active());
                    self.completed.push(completion);
                }
            }
        }

        // Snapshot, then deliver. Submissions made by callbacks land on the
        // (now empty) live queue and wait for the next flush.
        let mut ready = self.completed.take_all();
        while let Some(ptr) = ready.pop() {
            // SAFETY: ready-queue nodes are live submitted completions.
            let dispatch = unsafe {
                ptr.as_ref()
                    .dispatch
                    .expect("submitted completion lost its dispatch wrapper")
            };
            // SAFETY: single-threaded engine; the completion was unlinked by
            // the pop above.
            unsafe { dispatch(self, ptr) };
        }

        Ok(())
    }

    /// Expire timers: move every timer whose deadline has passed to the
    /// ready queue, in deadline order (ties broken by submission order),
    /// and report the minimum remaining duration of the survivors.
    ///
    /// The clock is sampled once per flush, and only when a timer is armed.
    /// Timers are appended unsorted at submission, so expired entries are
    /// extracted minimum-first; the extra passes are O(n) each over a list
    /// that is small in the intended workloads.
    fn flush_timeouts(&mut self) -> Option<u64> {
        if self.timeouts.is_empty() {
            return None;
        }
        let now_ns = self.now_ns();

        loop {
            let mut next_expired_ns: Option<u64> = None;
            let mut min_remaining_ns: Option<u64> = None;

            // Classify: earliest expired deadline, minimum remaining wait.
            let mut scan = self.timeouts.take_all();
            while let Some(mut ptr) = scan.pop() {
                // SAFETY: timer-queue nodes are live submitted completions.
                let completion = unsafe { ptr.as_mut() };
                let deadline_ns = timer_deadline(completion);

                if now_ns >= deadline_ns {
                    next_expired_ns =
                        Some(next_expired_ns.map_or(deadline_ns, |min| min.min(deadline_ns)));
                } else {
                    let remaining = deadline_ns - now_ns;
                    min_remaining_ns =
                        Some(min_remaining_ns.map_or(remaining, |min| min.min(remaining)));
                }
                self.timeouts.push(completion);
            }

            let Some(expired_ns) = next_expired_ns else {
                return min_remaining_ns;
            };

            // Move the earliest-submitted timer with that deadline to the
            // ready queue; everything else is re-queued in order.
            let mut moved = false;
            let mut scan = self.timeouts.take_all();
            while let Some(mut ptr) = scan.pop() {
                // SAFETY: as above.
                let completion = unsafe { ptr.as_mut() };
                if !moved && timer_deadline(completion) == expired_ns {
                    moved = true;
                    self.completed.push(completion);
                } else {
                    self.timeouts.push(completion);
                }
            }
            assert!(moved);
        }
    }

    /// Book one operation as kernel-owned. Called by dispatch wrappers when
    /// a start or poll reports "pending".
    #[inline]
    pub(crate) fn note_pending(&mut self) {
        self.io_pending = self
            .io_pending
            .checked_add(1)
            .expect("io_pending overflow");
    }

    /// Common submission path: arm the completion and route it to its queue.
    fn submit(
        &mut self,
        completion: &mut Completion,
        context: *mut c_void,
        dispatch: DispatchFn,
        operation: Operation,
    ) {
        completion.prepare(context, dispatch, operation);

        // Timers are routed by `timeout`; every other operation has its
        // initial attempt driven by the next flush.
        assert!(!matches!(completion.operation, Operation::Timeout { .. }));
        self.completed.push(completion);
    }

    /// Submits an accept on a listening socket previously created with
    /// [`open_socket`](Io::open_socket).
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn accept(
        &mut self,
        context: *mut c_void,
        callback: AcceptCallback,
        completion: &mut Completion,
        listen_socket: SOCKET,
    ) {
        assert!(listen_socket != INVALID_SOCKET);

        self.submit(
            completion,
            context,
            ops::dispatch_accept,
            Operation::Accept {
                listen_socket,
                client_socket: INVALID_SOCKET,
                address_buffer: [0; ACCEPT_ADDRESS_BUFFER_LEN],
                callback,
            },
        );
    }

    /// Submits a connect of `socket` (created with
    /// [`open_socket`](Io::open_socket), unbound) to `address`.
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn connect(
        &mut self,
        context: *mut c_void,
        callback: ConnectCallback,
        completion: &mut Completion,
        socket: SOCKET,
        address: std::net::SocketAddr,
    ) {
        assert!(socket != INVALID_SOCKET);

        self.submit(
            completion,
            context,
            ops::dispatch_connect,
            Operation::Connect {
                socket,
                address: socket2::SockAddr::from(address),
                pending: false,
                callback,
            },
        );
    }

    /// Submits a send of `buf[0..len]` on a connected socket. Lengths above
    /// `u32::MAX` are clamped; the callback reports bytes transferred.
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `buf[0..len]` must be valid for reads and outlive the operation
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn send(
        &mut self,
        context: *mut c_void,
        callback: SendCallback,
        completion: &mut Completion,
        socket: SOCKET,
        buf: *const u8,
        len: usize,
    ) {
        assert!(socket != INVALID_SOCKET);
        assert!(!buf.is_null());

        self.submit(
            completion,
            context,
            ops::dispatch_send,
            Operation::Send {
                socket,
                buf,
                len: buffer_limit(len),
                pending: false,
                callback,
            },
        );
    }

    /// Submits a receive of up to `len` bytes on a connected socket.
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `buf[0..len]` must be valid for writes and outlive the operation
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn recv(
        &mut self,
        context: *mut c_void,
        callback: RecvCallback,
        completion: &mut Completion,
        socket: SOCKET,
        buf: *mut u8,
        len: usize,
    ) {
        assert!(socket != INVALID_SOCKET);
        assert!(!buf.is_null());

        self.submit(
            completion,
            context,
            ops::dispatch_recv,
            Operation::Recv {
                socket,
                buf,
                len: buffer_limit(len),
                pending: false,
                callback,
            },
        );
    }

    /// Submits a positional read. Synchronous in this backend: the read
    /// executes during the flush that dispatches it, and the callback fires
    /// in the same flush.
    ///
    /// Direct-I/O handles require `buf`, `len`, and `offset` to be
    /// sector-aligned; misalignment surfaces as
    /// [`ReadError::Alignment`](super::ReadError::Alignment).
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `buf[0..len]` must be valid for writes and outlive the operation
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn read(
        &mut self,
        context: *mut c_void,
        callback: ReadCallback,
        completion: &mut Completion,
        fd: HANDLE,
        buf: *mut u8,
        len: usize,
        offset: u64,
    ) {
        assert!(fd != INVALID_HANDLE_VALUE);
        assert!(!buf.is_null());

        self.submit(
            completion,
            context,
            ops::dispatch_read,
            Operation::Read {
                fd,
                buf,
                len: buffer_limit(len),
                offset,
                callback,
            },
        );
    }

    /// Submits a positional write. Synchronous in this backend, like
    /// [`read`](Io::read).
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `buf[0..len]` must be valid for reads and outlive the operation
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn write(
        &mut self,
        context: *mut c_void,
        callback: WriteCallback,
        completion: &mut Completion,
        fd: HANDLE,
        buf: *const u8,
        len: usize,
        offset: u64,
    ) {
        assert!(fd != INVALID_HANDLE_VALUE);
        assert!(!buf.is_null());

        self.submit(
            completion,
            context,
            ops::dispatch_write,
            Operation::Write {
                fd,
                buf,
                len: buffer_limit(len),
                offset,
                callback,
            },
        );
    }

    /// Submits a close of a socket or kernel handle. Completes inline in
    /// the next flush.
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn close(
        &mut self,
        context: *mut c_void,
        callback: CloseCallback,
        completion: &mut Completion,
        fd: HANDLE,
    ) {
        assert!(fd != INVALID_HANDLE_VALUE);

        self.submit(
            completion,
            context,
            ops::dispatch_close,
            Operation::Close { fd, callback },
        );
    }

    /// Arms a timer: `callback` fires once at least `nanoseconds` have
    /// passed on the monotonic clock.
    ///
    /// A zero duration bypasses the timer list and becomes ready
    /// immediately (it still fires through the normal flush, never inline).
    ///
    /// Timers cannot be cancelled once submitted.
    ///
    /// # Safety (Caller Obligations)
    ///
    /// - `completion` must stay valid and immovable until `callback` fires
    /// - `context` must remain valid until the callback is invoked
    pub fn timeout(
        &mut self,
        context: *mut c_void,
        callback: TimeoutCallback,
        completion: &mut Completion,
        nanoseconds: u64,
    ) {
        assert!(nanoseconds < 1 << 63);

        if nanoseconds == 0 {
            // Fast path: straight to the ready queue. The deadline payload
            // is never inspected on this path.
            completion.prepare(
                context,
                ops::dispatch_timeout,
                Operation::Timeout {
                    deadline_ns: 0,
                    callback,
                },
            );
            self.completed.push(completion);
            return;
        }

        let deadline_ns = self
            .now_ns()
            .checked_add(nanoseconds)
            .expect("timer deadline overflow");

        completion.prepare(
            context,
            ops::dispatch_timeout,
            Operation::Timeout {
                deadline_ns,
                callback,
            },
        );
        self.timeouts.push(completion);
    }
}

impl Drop for Io {
    fn drop(&mut self) {
        // It is a logic error to tear down the engine with work outstanding.
        assert!(
            self.io_pending == 0,
            "Io dropped with kernel-pending operations"
        );
        assert!(
            self.completed.is_empty(),
            "Io dropped with undelivered completions"
        );
        assert!(self.timeouts.is_empty(), "Io dropped with armed timers");

        // SAFETY: `iocp` has been valid since `new`; invalidated below.
        unsafe { CloseHandle(self.iocp) };
        self.iocp = INVALID_HANDLE_VALUE;

        // SAFETY: paired with the WSAStartup in `new`.
        unsafe { WSACleanup() };

        log::debug!(target: "squall::io", "reactor torn down");
    }
}

/// Start Winsock 2.2. Paired with `WSACleanup` on the reactor's teardown
/// (and on the `new` failure path).
fn winsock_startup() -> io::Result<()> {
    // SAFETY: WSADATA is a plain out-structure.
    let mut wsa_data: WSADATA = unsafe { core::mem::zeroed() };
    // SAFETY: 0x0202 requests version 2.2.
    let code = unsafe { WSAStartup(0x0202, &mut wsa_data) };
    if code != 0 {
        return Err(io::Error::from_raw_os_error(code));
    }
    Ok(())
}

fn timer_deadline(completion: &Completion) -> u64 {
    match completion.operation {
        Operation::Timeout { deadline_ns, .. } => deadline_ns,
        _ => unreachable!("timer list holds a non-timeout operation"),
    }
}

/// Round a nanosecond wait to the port's millisecond granularity (half-up),
/// saturating just below INFINITE so the wait is always bounded.
fn timeout_to_ms(remaining_ns: u64) -> u32 {
    let ms = remaining_ns.saturating_add(NS_PER_MS / 2) / NS_PER_MS;
    ms.min(u64::from(u32::MAX - 1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = NS_PER_MS;

    #[test]
    fn rounding_half_up() {
        assert_eq!(timeout_to_ms(0), 0);
        assert_eq!(timeout_to_ms(MS / 2 - 1), 0);
        assert_eq!(timeout_to_ms(MS / 2), 1);
        assert_eq!(timeout_to_ms(MS), 1);
        assert_eq!(timeout_to_ms(3 * MS / 2), 2);
        // Saturates below INFINITE.
        assert_eq!(timeout_to_ms(u64::MAX), u32::MAX - 1);
    }

    struct TimerLog {
        fired: Vec<(u8, u64)>,
    }

    struct TimerContext {
        id: u8,
        log: *mut TimerLog,
    }

    unsafe fn on_timer(
        context: *mut c_void,
        io: &mut Io,
        _completion: &mut Completion,
        result: Result<(), TimeoutError>,
    ) {
        assert!(result.is_ok());
        let context = unsafe { &mut *context.cast::<TimerContext>() };
        let now_ns = io.now_ns();
        unsafe { (*context.log).fired.push((context.id, now_ns)) };
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut io = Io::new(32, 0).unwrap();
        let mut log = TimerLog { fired: Vec::new() };

        let mut context_1 = TimerContext { id: 1, log: &mut log };
        let mut context_2 = TimerContext { id: 2, log: &mut log };
        let mut context_3 = TimerContext { id: 3, log: &mut log };

        let mut completion_1 = Completion::new();
        let mut completion_2 = Completion::new();
        let mut completion_3 = Completion::new();

        // Submission order deliberately differs from deadline order.
        let submitted_ns = io.now_ns();
        io.timeout(
            (&mut context_1 as *mut TimerContext).cast(),
            on_timer,
            &mut completion_1,
            5 * MS,
        );
        io.timeout(
            (&mut context_2 as *mut TimerContext).cast(),
            on_timer,
            &mut completion_2,
            MS,
        );
        io.timeout(
            (&mut context_3 as *mut TimerContext).cast(),
            on_timer,
            &mut completion_3,
            3 * MS,
        );

        while log.fired.len() < 3 {
            io.tick().unwrap();
        }

        let order: Vec<u8> = log.fired.iter().map(|&(id, _)| id).collect();
        assert_eq!(order, vec![2, 3, 1]);

        // Each timer fired no earlier than its own deadline.
        for &(id, fired_ns) in &log.fired {
            let duration_ns = match id {
                1 => 5 * MS,
                2 => MS,
                3 => 3 * MS,
                _ => unreachable!(),
            };
            assert!(fired_ns >= submitted_ns + duration_ns);
        }

        assert!(io.is_idle());
    }

    #[test]
    fn timers_expiring_in_one_flush_fire_in_deadline_order() {
        let mut io = Io::new(32, 0).unwrap();
        let mut log = TimerLog { fired: Vec::new() };

        let mut context_1 = TimerContext { id: 1, log: &mut log };
        let mut context_2 = TimerContext { id: 2, log: &mut log };

        let mut completion_1 = Completion::new();
        let mut completion_2 = Completion::new();

        // The later deadline is submitted first; both expire before the
        // first flush runs.
        io.timeout(
            (&mut context_1 as *mut TimerContext).cast(),
            on_timer,
            &mut completion_1,
            2 * MS,
        );
        io.timeout(
            (&mut context_2 as *mut TimerContext).cast(),
            on_timer,
            &mut completion_2,
            MS,
        );

        std::thread::sleep(std::time::Duration::from_millis(5));
        io.tick().unwrap();

        let order: Vec<u8> = log.fired.iter().map(|&(id, _)| id).collect();
        assert_eq!(order, vec![2, 1]);
        assert!(io.is_idle());
    }

    #[test]
    fn zero_timeouts_fire_in_submission_order_within_one_tick() {
        let mut io = Io::new(32, 0).unwrap();
        let mut log = TimerLog { fired: Vec::new() };

        let mut context_1 = TimerContext { id: 1, log: &mut log };
        let mut context_2 = TimerContext { id: 2, log: &mut log };

        let mut completion_1 = Completion::new();
        let mut completion_2 = Completion::new();

        io.timeout(
            (&mut context_1 as *mut TimerContext).cast(),
            on_timer,
            &mut completion_1,
            0,
        );
        io.timeout(
            (&mut context_2 as *mut TimerContext).cast(),
            on_timer,
            &mut completion_2,
            0,
        );

        // The zero fast path skips the timer list entirely.
        assert!(io.timeouts.is_empty());
        assert!(io.completed.len() == 2);

        io.tick().unwrap();

        let order: Vec<u8> = log.fired.iter().map(|&(id, _)| id).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(io.is_idle());
    }

    #[test]
    fn armed_timer_sits_on_exactly_one_queue() {
        let mut io = Io::new(32, 0).unwrap();
        let mut log = TimerLog { fired: Vec::new() };
        let mut context = TimerContext { id: 1, log: &mut log };
        let mut completion = Completion::new();

        io.timeout(
            (&mut context as *mut TimerContext).cast(),
            on_timer,
            &mut completion,
            2 * MS,
        );

        assert!(completion.is_queued());
        assert!(io.timeouts.contains(&completion));
        assert!(!io.completed.contains(&completion));

        while log.fired.is_empty() {
            io.tick().unwrap();
        }

        assert!(!completion.is_queued());
        assert!(io.is_idle());
    }

    #[test]
    fn run_for_ns_returns_no_earlier_and_promptly() {
        let mut io = Io::new(32, 0).unwrap();

        let requested_ns = 10 * MS;
        let before = Instant::now();
        io.run_for_ns(requested_ns).unwrap();
        let elapsed_ns = before.elapsed().as_nanos() as u64;

        assert!(elapsed_ns >= requested_ns);
        // Prompt return: 1 ms rounding plus generous scheduling slack.
        assert!(elapsed_ns < requested_ns + 100 * MS);
        assert!(io.is_idle());
    }

    #[test]
    fn run_for_ns_zero_returns_immediately() {
        let mut io = Io::new(32, 0).unwrap();
        io.run_for_ns(0).unwrap();
        assert!(io.is_idle());
    }

    struct ChainContext {
        next_completion: Completion,
        first_fired_at_tick: Option<u32>,
        second_fired_at_tick: Option<u32>,
        tick: u32,
    }

    unsafe fn on_chain_second(
        context: *mut c_void,
        _io: &mut Io,
        _completion: &mut Completion,
        result: Result<(), TimeoutError>,
    ) {
        assert!(result.is_ok());
        let chain = unsafe { &mut *context.cast::<ChainContext>() };
        assert!(chain.second_fired_at_tick.is_none());
        chain.second_fired_at_tick = Some(chain.tick);
    }

    unsafe fn on_chain_first(
        context: *mut c_void,
        io: &mut Io,
        _completion: &mut Completion,
        result: Result<(), TimeoutError>,
    ) {
        assert!(result.is_ok());
        let chain = unsafe { &mut *context.cast::<ChainContext>() };
        assert!(chain.first_fired_at_tick.is_none());
        chain.first_fired_at_tick = Some(chain.tick);

        // Submitting from a callback is allowed; the new operation becomes
        // eligible no earlier than the next flush.
        let next = &mut chain.next_completion as *mut Completion;
        io.timeout(context, on_chain_second, unsafe { &mut *next }, 0);
    }

    #[test]
    fn callback_submission_is_deferred_to_the_next_flush() {
        let mut io = Io::new(32, 0).unwrap();
        let mut chain = ChainContext {
            next_completion: Completion::new(),
            first_fired_at_tick: None,
            second_fired_at_tick: None,
            tick: 0,
        };
        let mut completion = Completion::new();

        io.timeout(
            (&mut chain as *mut ChainContext).cast(),
            on_chain_first,
            &mut completion,
            0,
        );

        chain.tick = 1;
        io.tick().unwrap();
        assert_eq!(chain.first_fired_at_tick, Some(1));
        assert_eq!(chain.second_fired_at_tick, None);

        chain.tick = 2;
        io.tick().unwrap();
        assert_eq!(chain.second_fired_at_tick, Some(2));
        assert!(io.is_idle());
    }

    #[test]
    fn no_kernel_pending_work_for_pure_timers() {
        let mut io = Io::new(32, 0).unwrap();
        let mut log = TimerLog { fired: Vec::new() };
        let mut context = TimerContext { id: 1, log: &mut log };
        let mut completion = Completion::new();

        io.timeout(
            (&mut context as *mut TimerContext).cast(),
            on_timer,
            &mut completion,
            MS,
        );
        assert_eq!(io.io_pending, 0);

        while log.fired.is_empty() {
            io.tick().unwrap();
        }
        assert_eq!(io.io_pending, 0);
        assert!(io.is_idle());
    }
}
