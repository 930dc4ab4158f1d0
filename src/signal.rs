//! Unix signal wiring.
//!
//! SIGHUP/SIGINT/SIGTERM unlink the FIFO paths and then re-raise with
//! the default disposition so the exit status is preserved. SIGPIPE is
//! ignored; broken pipes surface as EPIPE on write.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;

static FIFO_PATHS: OnceLock<Vec<CString>> = OnceLock::new();

extern "C" fn on_fatal_signal(sig: libc::c_int) {
    // Only async-signal-safe calls from here.
    if let Some(paths) = FIFO_PATHS.get() {
        for path in paths {
            unsafe { libc::unlink(path.as_ptr()) };
        }
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Install the handlers. `fifo_paths` are unlinked if a fatal signal
/// arrives.
pub fn install(fifo_paths: &[impl AsRef<Path>]) {
    let paths = fifo_paths
        .iter()
        .map(|p| {
            CString::new(p.as_ref().as_os_str().as_bytes()).expect("fifo path contains NUL")
        })
        .collect();
    let _ = FIFO_PATHS.set(paths);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_fatal_signal as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
