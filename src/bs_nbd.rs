//! NBD-style remote block client backend
//!
//! Connects to a remote block endpoint over TCP or a unix domain socket,
//! performs the fixed-size handshake, and executes read/write requests with
//! a length-prefixed binary protocol. Completions arrive out of order and
//! are correlated back to their command through a generation-checked
//! in-flight table; the table index and generation travel in the protocol
//! handle, so a value supplied by the peer is never interpreted as anything
//! but a checked slot lookup.
//!
//! Submission may happen from any thread; the connection lock keeps each
//! header+payload pair atomic on the wire. Completion reads happen only on
//! the reactor thread, so the read side needs no lock against itself. Any
//! framing or handle violation during completion processing is treated as
//! connection-level corruption: the connection is torn down, every command
//! still in flight is failed with medium-error sense, and the transport is
//! reconnected with a fresh handshake.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

use crate::command::CmdRef;
use crate::error::{ScsiError, ScsiResult};
use crate::event::{EventSource, Interest, Readiness};
use crate::registry::{BackingStore, OpenOutcome, Submission};
use crate::scsi::{self, asc, sam_status, sense_key};

pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_RESPONSE_MAGIC: u32 = 0x6744_6698;
pub const HANDSHAKE_MAGIC: &[u8; 8] = b"NBDMAGIC";
pub const HANDSHAKE_SECRET: u64 = 0x0042_0281_8612_53;
/// magic + secret + capacity + 124 reserved bytes, read in one block
pub const HANDSHAKE_LEN: usize = 148;
pub const REQUEST_LEN: usize = 28;
pub const RESPONSE_LEN: usize = 16;

const NBD_READ: u32 = 0;
const NBD_WRITE: u32 = 1;
const NBD_DISCONNECT: u32 = 2;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Error,
    Reconnecting,
}

/// Wire request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NbdRequest {
    magic: u32,
    op: u32,
    handle: u64,
    offset: u64,
    len: u32,
}

impl NbdRequest {
    fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.op);
        BigEndian::write_u64(&mut buf[8..16], self.handle);
        BigEndian::write_u64(&mut buf[16..24], self.offset);
        BigEndian::write_u32(&mut buf[24..28], self.len);
        buf
    }
}

/// Wire response header
#[derive(Debug, Clone, Copy)]
struct NbdResponse {
    magic: u32,
    err: u32,
    handle: u64,
}

fn decode_response(buf: &[u8; RESPONSE_LEN]) -> NbdResponse {
    NbdResponse {
        magic: BigEndian::read_u32(&buf[0..4]),
        err: BigEndian::read_u32(&buf[4..8]),
        handle: BigEndian::read_u64(&buf[8..16]),
    }
}

/// Parse and validate the fixed-size handshake block, returning the capacity
fn parse_handshake(buf: &[u8; HANDSHAKE_LEN]) -> ScsiResult<u64> {
    if &buf[0..8] != HANDSHAKE_MAGIC {
        return Err(ScsiError::Protocol("handshake magic mismatch".to_string()));
    }
    if BigEndian::read_u64(&buf[8..16]) != HANDSHAKE_SECRET {
        return Err(ScsiError::Protocol("handshake secret mismatch".to_string()));
    }
    Ok(BigEndian::read_u64(&buf[16..24]))
}

/// Split a `host:port` or `host@port` locator
fn split_locator(locator: &str) -> ScsiResult<(&str, u16)> {
    let idx = locator
        .rfind('@')
        .or_else(|| locator.rfind(':'))
        .ok_or_else(|| ScsiError::Config(format!("no port in locator {:?}", locator)))?;
    let host = &locator[..idx];
    let port = locator[idx + 1..]
        .parse::<u16>()
        .map_err(|_| ScsiError::Config(format!("bad port in locator {:?}", locator)))?;
    Ok((host, port))
}

enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    /// A locator starting with `/` is a unix socket path, otherwise a
    /// network endpoint resolved through standard address resolution
    fn connect(locator: &str) -> ScsiResult<Transport> {
        if locator.starts_with('/') {
            Ok(Transport::Unix(UnixStream::connect(locator)?))
        } else {
            let (host, port) = split_locator(locator)?;
            Ok(Transport::Tcp(TcpStream::connect((host, port))?))
        }
    }

    fn try_clone(&self) -> io::Result<Transport> {
        match self {
            Transport::Tcp(s) => s.try_clone().map(Transport::Tcp),
            Transport::Unix(s) => s.try_clone().map(Transport::Unix),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Tcp(s) => s.as_raw_fd(),
            Transport::Unix(s) => s.as_raw_fd(),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            Transport::Unix(s) => s.flush(),
        }
    }
}

/// One outstanding request
struct InflightRec {
    req: NbdRequest,
    cmd: CmdRef,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    rec: Option<InflightRec>,
}

/// Correlation-handle table
///
/// The protocol handle is `(generation << 32) | slot_index`. The generation
/// is bumped on every insertion, so a stale or fabricated handle fails the
/// lookup instead of aliasing a newer request.
#[derive(Default)]
struct InflightTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl InflightTable {
    fn insert(&mut self, op: u32, offset: u64, len: u32, cmd: CmdRef) -> u64 {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[idx as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let handle = ((slot.generation as u64) << 32) | idx as u64;
        slot.rec = Some(InflightRec {
            req: NbdRequest {
                magic: NBD_REQUEST_MAGIC,
                op,
                handle,
                offset,
                len,
            },
            cmd,
        });
        handle
    }

    /// Resolve a handle returned by the peer and remove the record
    ///
    /// The record is validated against its own embedded header before it is
    /// trusted: the handle round-trip, the request magic and the operation
    /// must all be self-consistent, otherwise the handle is rejected and the
    /// record is left in place for the reconnect path to fail.
    fn complete(&mut self, handle: u64) -> ScsiResult<InflightRec> {
        let idx = (handle & 0xffff_ffff) as usize;
        let generation = (handle >> 32) as u32;
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or_else(|| ScsiError::Protocol(format!("handle {:#018x} out of range", handle)))?;
        if slot.generation != generation {
            return Err(ScsiError::Protocol(format!(
                "handle {:#018x} has stale generation",
                handle
            )));
        }
        let valid = matches!(&slot.rec, Some(rec)
            if rec.req.handle == handle
                && rec.req.magic == NBD_REQUEST_MAGIC
                && (rec.req.op == NBD_READ || rec.req.op == NBD_WRITE));
        if !valid {
            return Err(ScsiError::Protocol(format!(
                "handle {:#018x} does not match a live request",
                handle
            )));
        }
        // checked above
        let rec = slot.rec.take().unwrap();
        self.free.push(idx as u32);
        Ok(rec)
    }

    /// Drop a record after a synchronous submission failure
    fn cancel(&mut self, handle: u64) {
        let idx = (handle & 0xffff_ffff) as usize;
        if let Some(slot) = self.slots.get_mut(idx) {
            if slot.generation == (handle >> 32) as u32 && slot.rec.take().is_some() {
                self.free.push(idx as u32);
            }
        }
    }

    /// Remove every outstanding record (connection teardown)
    fn drain(&mut self) -> Vec<InflightRec> {
        let mut out = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(rec) = slot.rec.take() {
                out.push(rec);
                self.free.push(idx as u32);
            }
        }
        out
    }

    fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.rec.is_some()).count()
    }
}

/// State for one connection to a remote block endpoint
pub struct NbdConn {
    locator: String,
    ev: Arc<dyn EventSource>,
    /// Write side; the lock keeps header+payload pairs atomic on the wire
    writer: Mutex<Option<Transport>>,
    /// Read side; touched only from the reactor thread
    reader: Mutex<Option<Transport>>,
    state: Mutex<ConnState>,
    /// Capacity from the first handshake, in bytes (zero until negotiated)
    capacity: AtomicU64,
    inflight: Mutex<InflightTable>,
}

/// Readiness adapter registered with the event source
struct ConnHandler(Arc<NbdConn>);

impl Readiness for ConnHandler {
    fn on_ready(&self, _fd: RawFd, events: Interest) {
        if events.contains(Interest::ERROR) {
            log::error!("nbd connection error event");
            NbdConn::recover(&self.0);
            return;
        }
        if let Err(e) = self.0.process_one() {
            log::error!("nbd completion processing failed: {}", e);
            NbdConn::recover(&self.0);
        }
    }
}

impl NbdConn {
    fn new(locator: &str, ev: Arc<dyn EventSource>) -> Arc<NbdConn> {
        Arc::new(NbdConn {
            locator: locator.to_string(),
            ev,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            state: Mutex::new(ConnState::Disconnected),
            capacity: AtomicU64::new(0),
            inflight: Mutex::new(InflightTable::default()),
        })
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: ConnState) {
        *self.state.lock().unwrap() = s;
    }

    /// Negotiated capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Outstanding request count, for diagnostics
    pub fn outstanding(&self) -> usize {
        self.inflight.lock().unwrap().outstanding()
    }

    /// Open the transport and run the handshake; returns the descriptor of
    /// the read side for event registration
    fn connect(&self) -> ScsiResult<RawFd> {
        self.set_state(ConnState::Connecting);
        let mut transport = Transport::connect(&self.locator).map_err(|e| {
            self.set_state(ConnState::Disconnected);
            e
        })?;

        self.set_state(ConnState::Handshaking);
        let mut buf = [0u8; HANDSHAKE_LEN];
        let negotiated = transport
            .read_exact(&mut buf)
            .map_err(ScsiError::from)
            .and_then(|()| parse_handshake(&buf));
        let cap = match negotiated {
            Ok(cap) => cap,
            Err(e) => {
                transport.shutdown();
                self.set_state(ConnState::Disconnected);
                return Err(e);
            }
        };

        // Capacity is fixed by the first handshake; a differing value after
        // a reconnect is suspicious but does not resize the unit
        let prev = self.capacity.load(Ordering::Relaxed);
        if prev == 0 {
            self.capacity.store(cap, Ordering::Relaxed);
        } else if prev != cap {
            log::warn!(
                "capacity changed across reconnect ({} -> {}), keeping original",
                prev,
                cap
            );
        }

        let reader = transport.try_clone().map_err(|e| {
            transport.shutdown();
            self.set_state(ConnState::Disconnected);
            ScsiError::from(e)
        })?;
        let fd = reader.raw_fd();
        *self.reader.lock().unwrap() = Some(reader);
        *self.writer.lock().unwrap() = Some(transport);
        self.set_state(ConnState::Ready);
        log::info!("nbd connect to {:?} success, capacity {}", self.locator, cap);
        Ok(fd)
    }

    fn open(conn: &Arc<NbdConn>) -> ScsiResult<u64> {
        let fd = conn.connect()?;
        conn.ev
            .register(
                fd,
                Interest::READABLE | Interest::ERROR,
                Arc::new(ConnHandler(conn.clone())),
            )
            .map_err(|e| {
                conn.teardown_transport();
                conn.set_state(ConnState::Disconnected);
                e
            })?;
        Ok(conn.capacity())
    }

    /// Build and send one request; read/write only, sync-cache is a local
    /// no-op that never reaches the remote
    fn submit(&self, cmd: &CmdRef) -> ScsiResult<Submission> {
        let op = cmd.opcode();
        if scsi::is_sync_cache(op) {
            return Ok(Submission::Complete);
        }
        let (nbd_op, len) = if scsi::is_write(op) {
            (NBD_WRITE, cmd.out_len() as u32)
        } else if scsi::is_read(op) {
            (NBD_READ, cmd.in_len() as u32)
        } else {
            return Err(ScsiError::Backend(format!(
                "unsupported opcode {:#04x}",
                op
            )));
        };
        let offset = cmd.offset();

        let handle = self
            .inflight
            .lock()
            .unwrap()
            .insert(nbd_op, offset, len, cmd.clone());
        let header = NbdRequest {
            magic: NBD_REQUEST_MAGIC,
            op: nbd_op,
            handle,
            offset,
            len,
        }
        .encode();
        log::debug!(
            "nbd submit op={} handle={:#018x} offset={} len={}",
            nbd_op,
            handle,
            offset,
            len
        );

        cmd.mark_pending();
        let sent: io::Result<()> = {
            let mut guard = self.writer.lock().unwrap();
            match guard.as_mut() {
                Some(w) => {
                    // Header and payload go out under the same lock so no
                    // other submission can interleave on this socket
                    w.write_all(&header).and_then(|()| {
                        if nbd_op == NBD_WRITE {
                            cmd.with_out_buffer(|buf| w.write_all(buf))
                        } else {
                            Ok(())
                        }
                    })
                }
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "nbd connection not ready",
                )),
            }
        };

        match sent {
            Ok(()) => Ok(Submission::Pending),
            Err(e) => {
                log::error!("nbd send failed: {}", e);
                self.inflight.lock().unwrap().cancel(handle);
                cmd.clear_pending();
                cmd.build_sense(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR, 0);
                Err(e.into())
            }
        }
    }

    /// Read and finalize one completion; runs on the reactor thread
    fn process_one(&self) -> ScsiResult<()> {
        let mut guard = self.reader.lock().unwrap();
        let r = guard
            .as_mut()
            .ok_or_else(|| ScsiError::Protocol("nbd connection not ready".to_string()))?;

        let mut hdr = [0u8; RESPONSE_LEN];
        r.read_exact(&mut hdr)?;
        let res = decode_response(&hdr);
        if res.magic != NBD_RESPONSE_MAGIC {
            return Err(ScsiError::Protocol(format!(
                "bad response magic {:#010x}",
                res.magic
            )));
        }

        let rec = self.inflight.lock().unwrap().complete(res.handle)?;
        log::debug!(
            "nbd completion handle={:#018x} err={}",
            res.handle,
            res.err
        );

        if rec.req.op == NBD_READ {
            let len = rec.req.len as usize;
            let payload = rec.cmd.with_in_buffer(|buf| -> ScsiResult<()> {
                if buf.len() < len {
                    return Err(ScsiError::Protocol(
                        "read completion larger than command buffer".to_string(),
                    ));
                }
                r.read_exact(&mut buf[..len])?;
                Ok(())
            });
            if let Err(e) = payload {
                // The stream is no longer framed; fail this command here and
                // let the caller tear the connection down
                rec.cmd
                    .build_sense(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0);
                rec.cmd.io_done(sam_status::CHECK_CONDITION);
                return Err(e);
            }
            rec.cmd.set_in_actual(len);
        }

        if res.err == 0 {
            rec.cmd.io_done(sam_status::GOOD);
        } else {
            rec.cmd
                .build_sense(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR, 0);
            rec.cmd.io_done(sam_status::CHECK_CONDITION);
        }
        Ok(())
    }

    fn send_disconnect(&self) {
        let mut guard = self.writer.lock().unwrap();
        if let Some(w) = guard.as_mut() {
            let req = NbdRequest {
                magic: NBD_REQUEST_MAGIC,
                op: NBD_DISCONNECT,
                handle: 0,
                offset: 0,
                len: 0,
            };
            let _ = w.write_all(&req.encode());
        }
    }

    fn teardown_transport(&self) {
        if let Some(r) = self.reader.lock().unwrap().take() {
            r.shutdown();
        }
        if let Some(w) = self.writer.lock().unwrap().take() {
            w.shutdown();
        }
    }

    /// Tear down a corrupted connection and bring up a fresh one
    ///
    /// Requests in flight at the moment of failure cannot be matched to
    /// responses on the new connection; each is failed back to its command
    /// with medium-error sense rather than silently dropped.
    fn recover(conn: &Arc<NbdConn>) {
        conn.set_state(ConnState::Error);

        if let Some(fd) = conn.reader.lock().unwrap().as_ref().map(Transport::raw_fd) {
            let _ = conn.ev.deregister(fd);
        }

        // The transports must be gone before the in-flight table is drained:
        // once the writer is None a racing submit fails synchronously and
        // cancels its own record, so nothing can slip into the table between
        // the drain and the reconnect
        conn.send_disconnect();
        conn.teardown_transport();

        let stranded = conn.inflight.lock().unwrap().drain();
        if !stranded.is_empty() {
            log::warn!(
                "failing {} in-flight commands across nbd reconnect",
                stranded.len()
            );
        }
        for rec in stranded {
            let code = if rec.req.op == NBD_READ {
                asc::UNRECOVERED_READ_ERROR
            } else {
                asc::WRITE_ERROR
            };
            rec.cmd.build_sense(sense_key::MEDIUM_ERROR, code, 0);
            rec.cmd.io_done(sam_status::CHECK_CONDITION);
        }

        conn.set_state(ConnState::Reconnecting);

        match NbdConn::open(conn) {
            Ok(_) => log::info!("nbd reconnect to {:?} complete", conn.locator),
            Err(e) => {
                log::error!("nbd reconnect to {:?} failed: {}", conn.locator, e);
                conn.set_state(ConnState::Disconnected);
            }
        }
    }

    fn close(&self) {
        if let Some(fd) = self.reader.lock().unwrap().as_ref().map(Transport::raw_fd) {
            let _ = self.ev.deregister(fd);
        }
        self.send_disconnect();
        self.teardown_transport();
        self.set_state(ConnState::Disconnected);
    }
}

/// Backing store that forwards I/O to a remote NBD-style endpoint
pub struct NbdBackend {
    ev: Arc<dyn EventSource>,
    conn: Option<Arc<NbdConn>>,
}

impl NbdBackend {
    pub fn new(ev: Arc<dyn EventSource>) -> NbdBackend {
        NbdBackend { ev, conn: None }
    }

    /// Registry constructor
    pub fn create(ev: Arc<dyn EventSource>) -> Box<dyn BackingStore> {
        Box::new(NbdBackend::new(ev))
    }

    /// Connection handle, present after a successful open
    pub fn connection(&self) -> Option<Arc<NbdConn>> {
        self.conn.clone()
    }
}

impl BackingStore for NbdBackend {
    fn name(&self) -> &'static str {
        "nbd"
    }

    fn init(&mut self) -> ScsiResult<()> {
        Ok(())
    }

    fn open(&mut self, locator: &str) -> ScsiResult<OpenOutcome> {
        let conn = NbdConn::new(locator, self.ev.clone());
        let capacity = NbdConn::open(&conn)?;
        self.conn = Some(conn);
        Ok(OpenOutcome {
            capacity,
            read_only: false,
        })
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    fn exit(&mut self) {}

    fn submit(&self, cmd: &CmdRef) -> ScsiResult<Submission> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| ScsiError::Config("nbd backend not open".to_string()))?;
        conn.submit(cmd)
    }
}
