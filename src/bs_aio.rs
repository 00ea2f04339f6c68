//! Local-file backend with a worker-thread pool
//!
//! Reads and writes against a regular file or block device are executed on a
//! small pool of worker threads so the reactor thread never blocks in disk
//! I/O. Completions cross back to the reactor through a doorbell: the worker
//! pushes the finished command onto a queue and writes one byte to a socket
//! pair; the host reactor sees the read side become readable and the
//! registered handler drains the queue and finalizes each command.
//!
//! The file is opened with `O_DIRECT` where the filesystem supports it, with
//! a read-only fallback when the device or filesystem is write-protected.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::command::CmdRef;
use crate::error::{ScsiError, ScsiResult};
use crate::event::{EventSource, Interest, Readiness};
use crate::registry::{BackingStore, OpenOutcome, Submission};
use crate::scsi::{self, asc, sense_key};

/// Worker threads per unit
const WORKER_COUNT: usize = 2;
/// Bound on queued submissions before `submit` applies backpressure
const QUEUE_DEPTH: usize = 128;
/// Buffer alignment required for direct I/O
const DIRECT_IO_ALIGN: usize = 4096;

enum Job {
    Io { cmd: CmdRef, file: Arc<File> },
    Shutdown,
}

/// Byte buffer aligned for direct I/O
///
/// Plain `Vec` allocations carry no alignment guarantee, so direct reads and
/// writes go through an oversized allocation sliced at an aligned offset.
struct AlignedBuf {
    buf: Vec<u8>,
    off: usize,
    len: usize,
}

impl AlignedBuf {
    fn new(len: usize) -> AlignedBuf {
        let buf = vec![0u8; len + DIRECT_IO_ALIGN];
        let off = buf.as_ptr().align_offset(DIRECT_IO_ALIGN);
        AlignedBuf { buf, off, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.off..self.off + self.len]
    }
}

fn open_with_flags(path: &str, write: bool, direct: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(write);
    if direct {
        opts.custom_flags(libc::O_DIRECT);
    }
    opts.open(path)
}

fn readonly_fs(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EACCES) | Some(libc::EROFS))
}

fn rejects_direct(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINVAL)
}

/// Open the backing file, preferring read-write with direct I/O
///
/// Falls back to read-only when the file or filesystem is write-protected,
/// and retries without `O_DIRECT` on filesystems that reject the flag.
fn open_file(path: &str) -> ScsiResult<(File, bool)> {
    let mut direct = true;
    loop {
        match open_with_flags(path, true, direct) {
            Ok(f) => return Ok((f, false)),
            Err(e) if direct && rejects_direct(&e) => {
                log::debug!("direct I/O unsupported for {:?}, using buffered", path);
                direct = false;
            }
            Err(e) if readonly_fs(&e) => match open_with_flags(path, false, direct) {
                Ok(f) => {
                    log::warn!("{:?} is write-protected, opening read-only", path);
                    return Ok((f, true));
                }
                Err(e2) if direct && rejects_direct(&e2) => direct = false,
                Err(e2) => return Err(e2.into()),
            },
            Err(e) => return Err(e.into()),
        }
    }
}

/// Execute one command against the file; runs on a worker thread
fn execute(cmd: &CmdRef, file: &File) {
    let op = cmd.opcode();
    let offset = cmd.offset();
    let result = if scsi::is_sync_cache(op) {
        file.sync_all()
    } else if scsi::is_write(op) {
        cmd.with_out_buffer(|payload| {
            let mut bounce = AlignedBuf::new(payload.len());
            bounce.as_mut_slice().copy_from_slice(payload);
            file.write_all_at(bounce.as_slice(), offset)
        })
    } else {
        let mut bounce = AlignedBuf::new(cmd.in_len());
        file.read_exact_at(bounce.as_mut_slice(), offset)
            .map(|()| {
                cmd.fill_in_buffer(bounce.as_slice());
            })
    };
    if let Err(e) = result {
        log::error!(
            "file I/O for opcode {:#04x} at offset {} failed: {}",
            op,
            offset,
            e
        );
    }
}

fn worker_loop(
    rx: Arc<Mutex<Receiver<Job>>>,
    done: Arc<Mutex<VecDeque<CmdRef>>>,
    mut doorbell: UnixStream,
) {
    loop {
        let job = rx.lock().unwrap().recv();
        match job {
            Ok(Job::Io { cmd, file }) => {
                execute(&cmd, &file);
                done.lock().unwrap().push_back(cmd);
                if let Err(e) = doorbell.write_all(&[0u8]) {
                    log::error!("doorbell write failed: {}", e);
                }
            }
            Ok(Job::Shutdown) | Err(_) => break,
        }
    }
}

/// Reactor-side doorbell handler
///
/// The read side is non-blocking: the handler consumes one byte and pops one
/// queued completion at a time until the socket is empty, so it can never
/// stall the reactor thread. Any completion still queued after the bytes run
/// out (a worker's doorbell write failed) is finalized too rather than left
/// stranded; its I/O finished before the push.
struct DoorbellHandler {
    done: Arc<Mutex<VecDeque<CmdRef>>>,
    sock: Mutex<UnixStream>,
}

impl Readiness for DoorbellHandler {
    fn on_ready(&self, _fd: RawFd, _events: Interest) {
        let mut sock = self.sock.lock().unwrap();
        let mut byte = [0u8; 1];
        loop {
            match sock.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(cmd) = self.done.lock().unwrap().pop_front() {
                        cmd.io_done(crate::scsi::sam_status::GOOD);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("doorbell read failed: {}", e);
                    break;
                }
            }
        }
        drop(sock);

        let leftover: Vec<CmdRef> = self.done.lock().unwrap().drain(..).collect();
        for cmd in leftover {
            cmd.io_done(crate::scsi::sam_status::GOOD);
        }
    }
}

/// Backing store for a local file or block device
pub struct AioBackend {
    ev: Arc<dyn EventSource>,
    tx: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    doorbell_fd: Option<RawFd>,
    file: Option<Arc<File>>,
}

impl AioBackend {
    pub fn new(ev: Arc<dyn EventSource>) -> AioBackend {
        AioBackend {
            ev,
            tx: None,
            workers: Vec::new(),
            doorbell_fd: None,
            file: None,
        }
    }

    /// Registry constructor
    pub fn create(ev: Arc<dyn EventSource>) -> Box<dyn BackingStore> {
        Box::new(AioBackend::new(ev))
    }

    /// Descriptor of the doorbell read side, present after init
    pub fn doorbell_fd(&self) -> Option<RawFd> {
        self.doorbell_fd
    }
}

impl BackingStore for AioBackend {
    fn name(&self) -> &'static str {
        "aio"
    }

    /// Build the doorbell, register it, and start the worker pool
    fn init(&mut self) -> ScsiResult<()> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        let fd = reader.as_raw_fd();

        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let done = Arc::new(Mutex::new(VecDeque::new()));

        self.ev.register(
            fd,
            Interest::READABLE,
            Arc::new(DoorbellHandler {
                done: done.clone(),
                sock: Mutex::new(reader),
            }),
        )?;

        for i in 0..WORKER_COUNT {
            let rx = rx.clone();
            let done = done.clone();
            let doorbell = writer.try_clone()?;
            let handle = thread::Builder::new()
                .name(format!("aio-worker-{}", i))
                .spawn(move || worker_loop(rx, done, doorbell))?;
            self.workers.push(handle);
        }

        self.tx = Some(tx);
        self.doorbell_fd = Some(fd);
        Ok(())
    }

    fn open(&mut self, locator: &str) -> ScsiResult<OpenOutcome> {
        let (file, read_only) = open_file(locator)?;
        let capacity = file.metadata()?.len();
        self.file = Some(Arc::new(file));
        Ok(OpenOutcome {
            capacity,
            read_only,
        })
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn exit(&mut self) {
        if let Some(tx) = self.tx.take() {
            for _ in 0..self.workers.len() {
                let _ = tx.send(Job::Shutdown);
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("aio worker panicked");
            }
        }
        if let Some(fd) = self.doorbell_fd.take() {
            let _ = self.ev.deregister(fd);
        }
    }

    fn submit(&self, cmd: &CmdRef) -> ScsiResult<Submission> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ScsiError::Config("aio backend not initialized".to_string()))?;
        let file = self
            .file
            .as_ref()
            .cloned()
            .ok_or_else(|| ScsiError::Config("aio backend not open".to_string()))?;

        cmd.mark_pending();
        let job = Job::Io {
            cmd: cmd.clone(),
            file,
        };
        // Accept or reject immediately; submission never waits on a worker
        if let Err(e) = tx.try_send(job) {
            cmd.clear_pending();
            cmd.build_sense(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR, 0);
            let reason = match e {
                TrySendError::Full(_) => "aio queue full",
                TrySendError::Disconnected(_) => "aio worker pool is gone",
            };
            return Err(ScsiError::Backend(reason.to_string()));
        }
        Ok(Submission::Pending)
    }
}

impl Drop for AioBackend {
    fn drop(&mut self) {
        self.exit();
    }
}
