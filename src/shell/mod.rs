//! Login program discovery and pseudo-terminal plumbing.
//!
//! - [`locate_login_program`] — find the `login` binary once at startup.
//! - [`pty`] — PTY allocation, spawning the login program on the slave side,
//!   and non-blocking I/O on the master side.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::error::LoginError;

pub mod pty;

/// Name of the interactive login program.
pub const LOGIN_PROGRAM: &str = "login";

/// Searched when `$PATH` has no `login` (init scripts, procd).
const FALLBACK_PATH: &str = "/bin:/usr/bin:/sbin:/usr/sbin";

/// Locate the interactive login program.
///
/// An explicit path (from config) must be an executable file. Otherwise the
/// `login` binary is searched in `$PATH` the way `which login` would, then in
/// the well-known system directories in case `$PATH` is minimal.
pub fn locate_login_program(explicit: Option<&Path>) -> Result<PathBuf, LoginError> {
    if let Some(path) = explicit {
        return which::which(path).map_err(|_| LoginError::NotExecutable(path.to_path_buf()));
    }
    find_login(std::env::var_os("PATH"), OsStr::new(FALLBACK_PATH))
}

fn find_login(path_var: Option<OsString>, fallback: &OsStr) -> Result<PathBuf, LoginError> {
    which::which_in(LOGIN_PROGRAM, path_var, "/")
        .or_else(|_| which::which_in(LOGIN_PROGRAM, Some(fallback), "/"))
        .map_err(|_| LoginError::NotFound)
}
