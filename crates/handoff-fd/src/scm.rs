//! Carrying a [`DescriptorSet`] over a Unix domain socket.
//!
//! Descriptors travel as `SCM_RIGHTS` ancillary data next to the payload
//! bytes. These helpers move exactly one message each way; framing, partial
//! writes and retries belong to whatever transport sits on top.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

use libc::{c_int, c_uint, c_void};

use crate::descriptor_set::{DescriptorSet, MAX_DESCRIPTORS_PER_MESSAGE, close_descriptor};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: c_int = 0;

// `CMSG_SPACE`/`CMSG_LEN` are safe in current libc and unsafe in older ones.
#[allow(unused_unsafe)]
fn cmsg_space(fds: usize) -> usize {
    // SAFETY: pure size arithmetic.
    unsafe { libc::CMSG_SPACE((fds * mem::size_of::<c_int>()) as c_uint) as usize }
}

#[allow(unused_unsafe)]
fn cmsg_len(fds: usize) -> usize {
    // SAFETY: pure size arithmetic.
    unsafe { libc::CMSG_LEN((fds * mem::size_of::<c_int>()) as c_uint) as usize }
}

/// Control buffer aligned for `cmsghdr`.
fn control_buffer(len: usize) -> Vec<u64> {
    vec![0u64; len.div_ceil(mem::size_of::<u64>())]
}

/// Send `payload` with every descriptor in `set` attached.
///
/// On success the set is committed: its auto-close descriptors are closed
/// locally, since the kernel now holds references for the peer. On failure
/// the set is left untouched so the caller can retry or drop it.
///
/// Returns the number of payload bytes written, which on a stream socket may
/// be less than `payload.len()`. The descriptors always travel with the first
/// byte.
pub fn send_with_descriptors(
    socket: &UnixStream,
    payload: &[u8],
    set: &mut DescriptorSet,
) -> io::Result<usize> {
    if payload.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptors need at least one payload byte to travel with",
        ));
    }

    let fds = set.descriptors()?;

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut c_void,
        iov_len: payload.len(),
    };

    let space = if fds.is_empty() { 0 } else { cmsg_space(fds.len()) };
    let mut control = control_buffer(space);

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = space as _;

        // SAFETY: the control buffer is `space` bytes, aligned for cmsghdr and
        // large enough for one header plus `fds.len()` ints.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = cmsg_len(fds.len()) as _;
            ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg) as *mut c_int,
                fds.len(),
            );
        }
    }

    let sent = loop {
        // SAFETY: msg points at live iovec and control buffers.
        let n = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, SEND_FLAGS) };
        if n >= 0 {
            break n as usize;
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    };

    tracing::trace!(bytes = sent, descriptors = fds.len(), "sent message");
    set.commit_all();
    Ok(sent)
}

/// Receive one message into `buf` along with any attached descriptors.
///
/// Descriptors beyond [`MAX_DESCRIPTORS_PER_MESSAGE`], or truncated control
/// data, fail the whole receive: every descriptor that did arrive is closed
/// before the error is returned. A return of `0` bytes means the peer hung
/// up.
pub fn recv_with_descriptors(
    socket: &UnixStream,
    buf: &mut [u8],
) -> io::Result<(usize, DescriptorSet)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };

    let space = cmsg_space(MAX_DESCRIPTORS_PER_MESSAGE);
    let mut control = control_buffer(space);

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = space as _;

    let received = loop {
        // SAFETY: msg points at live iovec and control buffers.
        let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, RECV_FLAGS) };
        if n >= 0 {
            break n as usize;
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    };

    // SAFETY: recvmsg filled msg_controllen bytes of the control buffer.
    let fds = unsafe { collect_rights(&msg) };

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        tracing::warn!(
            arrived = fds.len(),
            "control data truncated, peer sent too many descriptors"
        );
        fds.iter().copied().for_each(close_descriptor);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "descriptor control data truncated",
        ));
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for &fd in &fds {
        set_cloexec(fd);
    }

    let mut set = DescriptorSet::new();
    if let Err(e) = set.set_descriptors(&fds) {
        tracing::warn!(arrived = fds.len(), error = %e, "rejecting over-declared descriptors");
        fds.iter().copied().for_each(close_descriptor);
        return Err(io::Error::new(io::ErrorKind::InvalidData, e));
    }

    tracing::trace!(bytes = received, descriptors = set.len(), "received message");
    Ok((received, set))
}

/// Gather every descriptor from `SCM_RIGHTS` headers in `msg`.
///
/// # Safety
///
/// `msg` must describe a control buffer filled in by `recvmsg`.
unsafe fn collect_rights(msg: &libc::msghdr) -> Vec<RawFd> {
    let mut fds = Vec::new();
    if msg.msg_controllen == 0 {
        return fds;
    }

    // SAFETY: the caller guarantees the control buffer is valid; the CMSG_*
    // walkers stay within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let header_len = data as usize - cmsg as usize;
                let data_len = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
                let count = data_len / mem::size_of::<c_int>();
                for i in 0..count {
                    fds.push(ptr::read_unaligned((data as *const c_int).add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    fds
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: RawFd) {
    // SAFETY: fcntl on an owned descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        let error = io::Error::last_os_error();
        tracing::debug!(fd, %error, "failed to set FD_CLOEXEC on received descriptor");
    }
}
