use super::{last_os_error, nonzero};
use crate::error::Result;
use std::{io, os::windows::io::RawHandle};
use winapi::{
    shared::minwindef::{DWORD, TRUE},
    um::{
        fileapi::{ReadFile, WriteFile},
        handleapi::{CloseHandle, SetHandleInformation},
        minwinbase::SECURITY_ATTRIBUTES,
        namedpipeapi::{CreatePipe, SetNamedPipeHandleState},
        winbase::{HANDLE_FLAG_INHERIT, PIPE_NOWAIT},
        winnt::HANDLE,
    },
};

#[derive(Debug)]
pub(crate) struct ReadPipe {
    handle: HANDLE,
}

unsafe impl Send for ReadPipe {}
unsafe impl Sync for ReadPipe {}

impl ReadPipe {
    pub fn raw(&self) -> RawHandle {
        self.handle as RawHandle
    }
}

impl io::Read for ReadPipe {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() > i32::max_value() as usize {
            buf = &mut buf[..(i32::max_value() as usize)];
        }
        let mut read_cnt: DWORD = 0;
        let res = unsafe {
            ReadFile(
                self.handle,
                buf.as_mut_ptr().cast(),
                buf.len() as u32,
                &mut read_cnt,
                std::ptr::null_mut(),
            )
        };
        if res == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(read_cnt as usize)
    }
}

impl Drop for ReadPipe {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

#[derive(Debug)]
pub(crate) struct WritePipe {
    handle: HANDLE,
}

unsafe impl Send for WritePipe {}
unsafe impl Sync for WritePipe {}

impl WritePipe {
    /// Switches the pipe to `PIPE_NOWAIT` so a full pipe surfaces as
    /// `WouldBlock` instead of stalling the multiplexing loop.
    pub fn set_nonblocking(&self) -> Result<()> {
        let mut mode: DWORD = PIPE_NOWAIT;
        nonzero(unsafe {
            SetNamedPipeHandleState(
                self.handle,
                &mut mode,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// The parent's end must not leak into the child.
    pub fn clear_inherit(&self) -> Result<()> {
        nonzero(unsafe { SetHandleInformation(self.handle, HANDLE_FLAG_INHERIT, 0) })?;
        Ok(())
    }
}

impl io::Write for WritePipe {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        if buf.len() > i32::max_value() as usize {
            buf = &buf[..(i32::max_value() as usize)];
        }
        let mut written_cnt: DWORD = 0;
        let res = unsafe {
            WriteFile(
                self.handle,
                buf.as_ptr().cast(),
                buf.len() as u32,
                &mut written_cnt,
                std::ptr::null_mut(),
            )
        };
        if res == 0 {
            return Err(io::Error::last_os_error());
        }
        if written_cnt == 0 && !buf.is_empty() {
            // PIPE_NOWAIT reports a full pipe as a zero-length write
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(written_cnt as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for WritePipe {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

/// Anonymous pipe with both ends inheritable; the caller strips the
/// inherit flag from the end it keeps.
pub(crate) fn make() -> Result<(ReadPipe, WritePipe)> {
    let mut read = std::ptr::null_mut();
    let mut write = std::ptr::null_mut();
    unsafe {
        let mut security_attributes: SECURITY_ATTRIBUTES = std::mem::zeroed();
        security_attributes.nLength = std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32;
        security_attributes.bInheritHandle = TRUE;
        if CreatePipe(&mut read, &mut write, &mut security_attributes, 0) == 0 {
            return Err(last_os_error());
        }
    }
    Ok((ReadPipe { handle: read }, WritePipe { handle: write }))
}
