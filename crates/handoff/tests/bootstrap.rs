//! End-to-end handle exchange.
//!
//! A broker publishes handles in a shared table, ships the table's segment to
//! a child over a socket, and the child looks the handles up through its own
//! mapping. The child runs on a thread, but everything it touches comes from
//! the socket, exactly as it would in a separate process.

#![cfg(all(any(target_os = "linux", target_os = "android"), feature = "fd"))]

use std::io::{Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use handoff::prelude::*;
use handoff::{CountingAsserter, MAX_DESCRIPTORS_PER_MESSAGE};
use parking_lot::Mutex;

const STDOUT_TAG: u32 = 1;
const SEGMENT_INDEX_TAG: u32 = 2;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Collects formatted log output so a test can look for specific events.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn with_captured_logs(f: impl FnOnce()) -> String {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    capture.contents()
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

#[test]
fn broker_hands_handles_to_child() {
    init_tracing();

    let (broker_socket, child_socket) = UnixStream::pair().unwrap();
    let (read_end, write_end) = pipe();

    let child = thread::spawn(move || {
        let mut buf = [0u8; 16];
        let (n, mut set) = recv_with_descriptors(&child_socket, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"boot");
        assert_eq!(set.len(), 2);

        let segment_fd = set.next_descriptor().unwrap();
        let pipe_fd = set.next_descriptor().unwrap();
        assert_eq!(set.next_descriptor(), None);

        let segment = ShmSegment::open(unsafe { OwnedFd::from_raw_fd(segment_fd) }).unwrap();
        let table = unsafe { SharedHandleTable::init(segment.region()) }.unwrap();

        // The table says which message slot holds the pipe.
        assert_eq!(table.get_handle(SEGMENT_INDEX_TAG), Ok(0));
        assert_eq!(table.get_handle(STDOUT_TAG), Ok(1));

        let mut out = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(pipe_fd) });
        out.write_all(b"hello from the child").unwrap();
    });

    let segment = ShmSegment::create(&SegmentConfig::default()).unwrap();
    let table = unsafe { SharedHandleTable::init(segment.region()) }.unwrap();
    table.set_handle(SEGMENT_INDEX_TAG, 0).unwrap();
    table.set_handle(STDOUT_TAG, 1).unwrap();

    let mut set = DescriptorSet::new();
    set.add_and_auto_close(segment.try_clone_fd().unwrap().into_raw_fd())
        .unwrap();
    set.add_and_auto_close(write_end).unwrap();
    assert!(!set.contains_directory_descriptor());

    // Writing the table before sending is the happens-before edge the child
    // relies on.
    send_with_descriptors(&broker_socket, b"boot", &mut set).unwrap();
    assert!(set.is_empty());

    child.join().unwrap();

    let mut reader = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(read_end) });
    let mut received = String::new();
    reader.read_to_string(&mut received).unwrap();
    assert_eq!(received, "hello from the child");
}

#[test]
fn decode_buffer_hands_off_to_message() {
    init_tracing();

    let (a, b) = UnixStream::pair().unwrap();
    let (read_end, write_end) = pipe();

    let mut outgoing = DescriptorSet::new();
    outgoing.add_and_auto_close(write_end).unwrap();
    send_with_descriptors(&a, b"m", &mut outgoing).unwrap();

    let mut buf = [0u8; 1];
    let (_, mut decoded) = recv_with_descriptors(&b, &mut buf).unwrap();

    // The long-lived message takes the descriptors; the decode buffer is
    // left empty and dropping it closes nothing.
    let mut message = DescriptorSet::new();
    message.take_from(&mut decoded).unwrap();
    assert!(decoded.is_empty());
    drop(decoded);
    assert_eq!(message.len(), 1);

    // Dispatch never consumes the descriptor; dropping the message closes
    // it, so the pipe reaches EOF.
    drop(message);
    let mut reader = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(read_end) });
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn full_message_round_trips() {
    init_tracing();

    let (a, b) = UnixStream::pair().unwrap();
    let pipes: Vec<_> = (0..MAX_DESCRIPTORS_PER_MESSAGE).map(|_| pipe()).collect();

    let mut set = DescriptorSet::new();
    for &(_, write_end) in &pipes {
        set.add_and_auto_close(write_end).unwrap();
    }
    let (extra_read, extra_write) = pipe();
    assert!(set.add_and_auto_close(extra_write).is_err());
    unsafe {
        libc::close(extra_read);
        libc::close(extra_write);
    }

    send_with_descriptors(&a, b"full", &mut set).unwrap();

    let mut buf = [0u8; 4];
    let (_, mut received) = recv_with_descriptors(&b, &mut buf).unwrap();
    assert_eq!(received.len(), MAX_DESCRIPTORS_PER_MESSAGE);

    for (i, &(read_end, _)) in pipes.iter().enumerate() {
        let fd = received.next_descriptor().unwrap();
        let mut writer = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        writer.write_all(&[i as u8]).unwrap();
        drop(writer);

        let mut reader = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(read_end) });
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, [i as u8]);
    }
    assert_eq!(received.next_descriptor(), None);
}

/// A non-thread-safe object guarded the way callers are expected to.
struct Registry {
    entries: std::cell::UnsafeCell<Vec<u32>>,
    warner: ThreadCollisionWarner<CountingAsserter>,
}

// SAFETY: the tests only call `push` from one thread at a time, which the
// warner checks.
unsafe impl Sync for Registry {}

impl Registry {
    fn push(&self, value: u32) {
        let _scope = self.warner.scoped();
        unsafe { (*self.entries.get()).push(value) };
    }
}

#[test]
fn guarded_object_used_from_one_thread_at_a_time() {
    init_tracing();

    let registry = Arc::new(Registry {
        entries: std::cell::UnsafeCell::new(Vec::new()),
        warner: ThreadCollisionWarner::with_asserter(CountingAsserter::new()),
    });

    for value in 0..4 {
        let registry = registry.clone();
        thread::spawn(move || registry.push(value)).join().unwrap();
    }

    assert_eq!(registry.warner.asserter().count(), 0);
    assert_eq!(unsafe { (*registry.entries.get()).len() }, 4);
}

#[test]
fn dropping_unconsumed_descriptors_warns() {
    let (read_end, write_end) = pipe();

    let logs = with_captured_logs(|| {
        let mut set = DescriptorSet::new();
        set.add_and_auto_close(write_end).unwrap();
        drop(set);
    });
    assert!(logs.contains("WARN"), "{logs}");
    assert!(logs.contains("unconsumed descriptors"), "{logs}");
    assert!(logs.contains("closed=1"), "{logs}");

    // The write end was closed by the drop.
    let mut reader = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(read_end) });
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn consumed_descriptors_drop_quietly() {
    let (read_end, write_end) = pipe();

    let logs = with_captured_logs(|| {
        let mut set = DescriptorSet::new();
        set.add_and_auto_close(write_end).unwrap();
        assert_eq!(set.next_descriptor(), Some(write_end));
        drop(set);

        let mut empty = DescriptorSet::new();
        empty.commit_all();
    });
    assert!(!logs.contains("unconsumed descriptors"), "{logs}");

    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}
