use super::{last_os_error, nonzero};
use crate::{
    error::{Error, Result},
    RawStatus, SpawnOptions,
};
use std::{
    ffi::OsStr,
    os::windows::{ffi::OsStrExt, io::RawHandle},
    path::Path,
};
use winapi::{
    shared::winerror::WAIT_TIMEOUT,
    um::{
        handleapi::CloseHandle,
        minwinbase::STILL_ACTIVE,
        processthreadsapi::{
            CreateProcessW, GetExitCodeProcess, PROCESS_INFORMATION, STARTUPINFOW,
        },
        synchapi::WaitForSingleObject,
        winbase::{
            CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, STARTF_USESTDHANDLES, WAIT_OBJECT_0,
        },
        winnt::HANDLE,
    },
};

pub(crate) struct OwnedHandle(HANDLE);

unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    pub fn as_raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

pub(crate) struct ChildHandle {
    pid: u32,
    handle: OwnedHandle,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking status probe. `STILL_ACTIVE` (259) is a valid exit
    /// code, so a zero-timeout wait disambiguates it.
    pub fn poll(&self) -> Result<Option<RawStatus>> {
        let mut code = 0;
        nonzero(unsafe { GetExitCodeProcess(self.handle.as_raw(), &mut code) })?;
        if code == STILL_ACTIVE {
            let waited = unsafe { WaitForSingleObject(self.handle.as_raw(), 0) };
            if waited == WAIT_TIMEOUT {
                return Ok(None);
            }
            if waited != WAIT_OBJECT_0 {
                return Err(last_os_error());
            }
        }
        Ok(Some(RawStatus {
            exit_code: code as i32,
            signaled: false,
            term_signal: -1,
        }))
    }

    /// Windows has no signal numbers; any signal is delivered as a
    /// forced `taskkill` of the whole process tree.
    pub fn signal(&self, _sig: i32) -> Result<()> {
        let output = std::process::Command::new("taskkill")
            .args(&["/F", "/T", "/PID"])
            .arg(self.pid.to_string())
            .output()
            .map_err(|e| Error::Io { cause: e })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::runtime(format!(
                "taskkill failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Starts `cmdline` with the given standard handles. The environment
/// is inherited from the current process, which the supervisor has
/// already primed. `suppress_errors` and `bypass_shell` are implied:
/// the line goes to `CreateProcessW` directly, windowless.
pub(crate) fn spawn_cmdline(
    cmdline: &OsStr,
    stdin: RawHandle,
    stdout: RawHandle,
    stderr: RawHandle,
    cwd: Option<&Path>,
    options: &SpawnOptions,
) -> Result<ChildHandle> {
    let mut cmdline = wide(cmdline);
    let cwd_wide = cwd.map(|p| wide(p.as_os_str()));
    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    startup.dwFlags = STARTF_USESTDHANDLES;
    startup.hStdInput = stdin as HANDLE;
    startup.hStdOutput = stdout as HANDLE;
    startup.hStdError = stderr as HANDLE;
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let flags = CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW | options.creation_flags;
    let created = unsafe {
        CreateProcessW(
            std::ptr::null(),
            cmdline.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            1,
            flags,
            std::ptr::null_mut(),
            cwd_wide
                .as_ref()
                .map(|w| w.as_ptr())
                .unwrap_or(std::ptr::null()),
            &mut startup,
            &mut info,
        )
    };
    if created == 0 {
        return Err(last_os_error());
    }
    unsafe {
        CloseHandle(info.hThread);
    }
    Ok(ChildHandle {
        pid: info.dwProcessId,
        handle: OwnedHandle(info.hProcess),
    })
}
