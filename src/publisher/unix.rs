//! Unix FIFO publishing backend.
//!
//! One FIFO per endpoint and a single worker thread. Every 50 ms the
//! worker tries a non-blocking open on each disconnected FIFO (which
//! succeeds once a reader is at the other end), snapshots the endpoint's
//! front buffer, and drains it with non-blocking writes, waiting for
//! writability with `select`. A reader that disconnects mid-write just
//! schedules a reconnect; the buffer stays valid for the next reader.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::publisher::Ring;
use crate::shutdown::Shutdown;

/// Poll cadence for reconnect attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grow the pipe to this multiple of the frame being served, so a whole
/// segment fits without a blocked writer. Kept a constant on purpose.
const PIPE_CAPACITY_FACTOR: usize = 5;

/// The set of FIFO paths for one ring, created up front and unlinked on
/// teardown.
pub struct FifoEndpoints {
    paths: Vec<PathBuf>,
}

impl FifoEndpoints {
    /// Create `count` FIFOs named `tsmemseg_<seg_name>NN.fifo` under
    /// `dir`. On any failure every FIFO created so far is removed in
    /// reverse order.
    pub fn create(dir: &Path, seg_name: &str, count: usize) -> io::Result<Self> {
        let mut paths = Vec::with_capacity(count);
        for i in 0..count {
            let path = dir.join(format!("tsmemseg_{seg_name}{i:02}.fifo"));
            let cpath = cstring(&path);
            // A stale FIFO from a crashed run would otherwise fail mkfifo.
            unsafe { libc::unlink(cpath.as_ptr()) };
            if unsafe { libc::mkfifo(cpath.as_ptr(), 0o644) } != 0 {
                let err = io::Error::last_os_error();
                let created = Self { paths };
                created.unlink_all();
                return Err(err);
            }
            paths.push(path);
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Remove the FIFO paths, newest first.
    pub fn unlink_all(&self) {
        for path in self.paths.iter().rev() {
            let cpath = cstring(path);
            unsafe { libc::unlink(cpath.as_ptr()) };
        }
    }
}

fn cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).expect("fifo path contains NUL")
}

enum Connection {
    Idle,
    Writing {
        fd: libc::c_int,
        buf: Arc<Vec<u8>>,
        pos: usize,
    },
}

/// Spawn the single publisher worker thread.
pub fn spawn_worker(
    ring: Arc<Ring>,
    endpoints: Arc<FifoEndpoints>,
    shutdown: Arc<Shutdown>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("tsmemseg-publisher".into())
        .spawn(move || worker(&ring, &endpoints, &shutdown))
        .expect("spawn publisher worker")
}

fn worker(ring: &Ring, endpoints: &FifoEndpoints, shutdown: &Shutdown) {
    let mut connections: Vec<Connection> = Vec::new();
    connections.resize_with(endpoints.paths().len(), || Connection::Idle);

    while !shutdown.wait_timeout(POLL_INTERVAL) {
        for (endpoint, connection) in connections.iter_mut().enumerate() {
            if let Connection::Idle = connection {
                let path = cstring(&endpoints.paths()[endpoint]);
                let fd = unsafe {
                    libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK)
                };
                if fd < 0 {
                    // ENXIO: no reader yet.
                    continue;
                }
                ring.touch();
                let buf = ring.begin_read(endpoint);
                set_pipe_capacity(fd, buf.len() * PIPE_CAPACITY_FACTOR);
                *connection = Connection::Writing { fd, buf, pos: 0 };
            }
            if drive_write(connection, ring) {
                finish(connection, ring, endpoint);
            }
        }
    }

    for (endpoint, connection) in connections.iter_mut().enumerate() {
        if matches!(connection, Connection::Writing { .. }) {
            finish(connection, ring, endpoint);
        }
    }
}

/// Push bytes until the frame is drained (true) or the pipe is full /
/// broken (false keeps or drops the connection as appropriate).
fn drive_write(connection: &mut Connection, ring: &Ring) -> bool {
    let Connection::Writing { fd, buf, pos } = connection else {
        return false;
    };
    loop {
        if *pos >= buf.len() {
            return true;
        }
        let remaining = &buf[*pos..];
        let n = unsafe {
            libc::write(
                *fd,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
            )
        };
        if n > 0 {
            *pos += n as usize;
            ring.touch();
            continue;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                // The reader is slow; wait briefly for writability and
                // move on if it stays full.
                if !wait_writable(*fd, POLL_INTERVAL) {
                    return false;
                }
            }
            _ => {
                // EPIPE and friends: the reader went away. The frame
                // stays staged for the next one.
                tracing::debug!("pipe write failed: {err}");
                return true;
            }
        }
    }
}

fn finish(connection: &mut Connection, ring: &Ring, endpoint: usize) {
    if let Connection::Writing { fd, .. } = connection {
        unsafe { libc::close(*fd) };
        ring.end_read(endpoint);
        ring.touch();
    }
    *connection = Connection::Idle;
}

/// `select` on writability; falls back to a short sleep for descriptors
/// beyond `FD_SETSIZE`.
fn wait_writable(fd: libc::c_int, timeout: Duration) -> bool {
    if fd as usize >= libc::FD_SETSIZE {
        thread::sleep(Duration::from_millis(10));
        return true;
    }
    unsafe {
        let mut set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        libc::FD_SET(fd, &mut set);
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let r = libc::select(
            fd + 1,
            std::ptr::null_mut(),
            &mut set,
            std::ptr::null_mut(),
            &mut tv,
        );
        r > 0 && libc::FD_ISSET(fd, &set)
    }
}

#[cfg(target_os = "linux")]
fn set_pipe_capacity(fd: libc::c_int, wanted: usize) {
    // Best effort; the default capacity still works, just with more
    // round trips.
    unsafe {
        libc::fcntl(fd, libc::F_SETPIPE_SZ, wanted as libc::c_int);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_pipe_capacity(_fd: libc::c_int, _wanted: usize) {}
