use std::io;
use std::time::Duration;

/// Readiness bits for [`HciTransport::poll`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct PollFlags {
    pub readable: bool,
    pub writable: bool,
}

impl PollFlags {
    pub const NONE: PollFlags = PollFlags {
        readable: false,
        writable: false,
    };
    pub const READABLE: PollFlags = PollFlags {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: PollFlags = PollFlags {
        readable: false,
        writable: true,
    };
}

/// A raw H4 byte channel to the controller.
///
/// Methods take `&self`: the read loop and the write loop share one transport,
/// the way two threads share a file descriptor.
pub trait HciTransport: Send + Sync + 'static {
    /// Non-blocking read. `ErrorKind::WouldBlock` when nothing is buffered.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// May write fewer bytes than offered; `WouldBlock` when not writable.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Waits up to `timeout` for any of `interest`. Returns the ready subset,
    /// empty on timeout.
    fn poll(&self, interest: PollFlags, timeout: Duration) -> io::Result<PollFlags>;
}
