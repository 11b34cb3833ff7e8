//! OS error preservation across release-GIL calls.
//!
//! The `saveerr` argument of `CALL_RELEASE_GIL_*` is a combination of the
//! `RFFI_*` flags. [`before_call`] runs after the lock is dropped and primes
//! the OS values from the thread's saved slots; [`after_call`] runs before
//! the lock is taken back and captures them, since running other code under
//! the lock may clobber the OS globals.

use crate::context::ThreadContext;

/// Save `errno` after the call
pub const RFFI_SAVE_ERRNO: i64 = 1;
/// Load `errno` from the saved slot before the call
pub const RFFI_READSAVED_ERRNO: i64 = 2;
/// Set `errno` to zero before the call
pub const RFFI_ZERO_ERRNO_BEFORE: i64 = 4;
/// Save `GetLastError()` after the call (Windows)
pub const RFFI_SAVE_LASTERROR: i64 = 8;
/// Load the last error from the saved slot before the call (Windows)
pub const RFFI_READSAVED_LASTERROR: i64 = 16;
/// Save `WSAGetLastError()` after the call (Windows)
pub const RFFI_SAVE_WSALASTERROR: i64 = 32;
/// Use the alternate slots instead of the primary ones
pub const RFFI_ALT_ERRNO: i64 = 64;

/// Save and restore `errno`
pub const RFFI_FULL_ERRNO: i64 = RFFI_SAVE_ERRNO | RFFI_READSAVED_ERRNO;
/// Zero before, save after
pub const RFFI_FULL_ERRNO_ZERO: i64 = RFFI_SAVE_ERRNO | RFFI_ZERO_ERRNO_BEFORE;
/// Save and restore the last error
pub const RFFI_FULL_LASTERROR: i64 = RFFI_SAVE_LASTERROR | RFFI_READSAVED_LASTERROR;

// ---------------------------------------------------------------------------
// errno access
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
fn errno_location() -> *mut i32 {
    // SAFETY: always returns this thread's errno cell.
    unsafe { libc::__errno_location() }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
fn errno_location() -> *mut i32 {
    // SAFETY: always returns this thread's errno cell.
    unsafe { libc::__error() }
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
fn errno_location() -> *mut i32 {
    // SAFETY: always returns this thread's errno cell.
    unsafe { libc::__errno() }
}

#[cfg(windows)]
unsafe extern "C" {
    fn _errno() -> *mut i32;
}

#[cfg(windows)]
fn errno_location() -> *mut i32 {
    // SAFETY: the CRT returns this thread's errno cell.
    unsafe { _errno() }
}

/// The calling thread's `errno`
pub fn get_errno() -> i32 {
    // SAFETY: errno_location points at a live thread-local int.
    unsafe { *errno_location() }
}

/// Overwrite the calling thread's `errno`
pub fn set_errno(value: i32) {
    // SAFETY: errno_location points at a live thread-local int.
    unsafe { *errno_location() = value }
}

// ---------------------------------------------------------------------------
// last error (Windows only)
// ---------------------------------------------------------------------------

/// The calling thread's `GetLastError()`; always 0 off Windows
pub fn get_last_error() -> u32 {
    #[cfg(windows)]
    {
        // SAFETY: plain Win32 call.
        unsafe { windows_sys::Win32::Foundation::GetLastError() }
    }
    #[cfg(not(windows))]
    {
        0
    }
}

/// Overwrite the calling thread's last error; no-op off Windows
pub fn set_last_error(_value: u32) {
    #[cfg(windows)]
    {
        // SAFETY: plain Win32 call.
        unsafe { windows_sys::Win32::Foundation::SetLastError(_value) }
    }
}

/// The calling thread's `WSAGetLastError()`; always 0 off Windows
pub fn get_wsa_last_error() -> u32 {
    #[cfg(windows)]
    {
        // SAFETY: plain Winsock call.
        unsafe { windows_sys::Win32::Networking::WinSock::WSAGetLastError() as u32 }
    }
    #[cfg(not(windows))]
    {
        0
    }
}

// ---------------------------------------------------------------------------
// Call protocol
// ---------------------------------------------------------------------------

/// Prime OS error values before a native call (lock already released)
pub fn before_call(ctx: &ThreadContext, flags: i64) {
    let alt = flags & RFFI_ALT_ERRNO != 0;
    if flags & RFFI_READSAVED_ERRNO != 0 {
        set_errno(if alt {
            ctx.saved_alt_errno()
        } else {
            ctx.saved_errno()
        });
    } else if flags & RFFI_ZERO_ERRNO_BEFORE != 0 {
        set_errno(0);
    }
    if cfg!(windows) && flags & RFFI_READSAVED_LASTERROR != 0 {
        set_last_error(if alt {
            ctx.saved_alt_lasterror()
        } else {
            ctx.saved_lasterror()
        });
    }
}

/// Capture OS error values after a native call (lock not yet reacquired)
pub fn after_call(ctx: &ThreadContext, flags: i64) {
    let alt = flags & RFFI_ALT_ERRNO != 0;
    if cfg!(windows) {
        let lasterror = if flags & RFFI_SAVE_LASTERROR != 0 {
            Some(get_last_error())
        } else if flags & RFFI_SAVE_WSALASTERROR != 0 {
            Some(get_wsa_last_error())
        } else {
            None
        };
        if let Some(err) = lasterror {
            if alt {
                ctx.set_saved_alt_lasterror(err);
            } else {
                ctx.set_saved_lasterror(err);
            }
        }
    }
    if flags & RFFI_SAVE_ERRNO != 0 {
        let err = get_errno();
        if alt {
            ctx.set_saved_alt_errno(err);
        } else {
            ctx.set_saved_errno(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_flags() {
        assert_eq!(RFFI_FULL_ERRNO, 3);
        assert_eq!(RFFI_FULL_ERRNO_ZERO, 5);
        assert_eq!(RFFI_FULL_LASTERROR, 24);
    }

    #[test]
    fn errno_roundtrip() {
        set_errno(17);
        assert_eq!(get_errno(), 17);
        set_errno(0);
    }

    #[test]
    fn readsaved_wins_over_zero() {
        let ctx = ThreadContext::new();
        ctx.set_saved_errno(33);
        set_errno(5);
        before_call(&ctx, RFFI_READSAVED_ERRNO | RFFI_ZERO_ERRNO_BEFORE);
        assert_eq!(get_errno(), 33);
        before_call(&ctx, RFFI_ZERO_ERRNO_BEFORE);
        assert_eq!(get_errno(), 0);
    }

    #[test]
    fn save_alt_leaves_primary() {
        let ctx = ThreadContext::new();
        ctx.set_saved_errno(1);
        ctx.set_saved_alt_errno(2);
        set_errno(99);
        after_call(&ctx, RFFI_SAVE_ERRNO | RFFI_ALT_ERRNO);
        assert_eq!((ctx.saved_errno(), ctx.saved_alt_errno()), (1, 99));
        set_errno(0);
    }
}
