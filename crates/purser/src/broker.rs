//! Job-broker client.
//!
//! The broker speaks the gearman binary protocol: a 12-byte header (magic
//! `\0REQ`/`\0RES`, big-endian packet type, big-endian payload length)
//! followed by NUL-separated arguments. The engine consumes it as five
//! logical operations: submit, subscribe, report-progress, report-completion
//! and register-task-handler.
//!
//! [`BrokerClient`] is the submit side; [`WorkerSession`] is the subscribe
//! side driven by the worker runtime.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::Rng;
use thiserror::Error;

const MAGIC_REQ: &[u8; 4] = b"\0REQ";
const MAGIC_RES: &[u8; 4] = b"\0RES";

/// Poll interval for the grab/sleep loop; bounds how long a quit signal can
/// go unnoticed while idle.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic in packet header: {0:?}")]
    BadMagic([u8; 4]),
    #[error("unknown packet type: {0}")]
    UnknownType(u32),
    #[error("packet {0:?} carries {1} arguments, expected {2}")]
    BadArgCount(PacketKind, usize, usize),
    #[error("broker reported error {code}: {message}")]
    Broker { code: String, message: String },
}

/// Packet types the engine exchanges with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketKind {
    CanDo = 1,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    SetClientId = 22,
    WorkException = 25,
    WorkData = 28,
    WorkWarning = 29,
}

impl PacketKind {
    fn from_code(code: u32) -> Result<Self, ProtocolError> {
        let kind = match code {
            1 => Self::CanDo,
            4 => Self::PreSleep,
            6 => Self::Noop,
            7 => Self::SubmitJob,
            8 => Self::JobCreated,
            9 => Self::GrabJob,
            10 => Self::NoJob,
            11 => Self::JobAssign,
            12 => Self::WorkStatus,
            13 => Self::WorkComplete,
            14 => Self::WorkFail,
            16 => Self::EchoReq,
            17 => Self::EchoRes,
            18 => Self::SubmitJobBg,
            19 => Self::Error,
            22 => Self::SetClientId,
            25 => Self::WorkException,
            28 => Self::WorkData,
            29 => Self::WorkWarning,
            other => return Err(ProtocolError::UnknownType(other)),
        };
        Ok(kind)
    }
}

/// One framed packet: type plus NUL-separated arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    pub fn new(kind: PacketKind, args: &[&[u8]]) -> Self {
        Self {
            kind,
            args: args.iter().map(|a| a.to_vec()).collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.args.join(&0u8);
        let mut out = Vec::with_capacity(12 + body.len());
        out.extend_from_slice(MAGIC_REQ);
        out.extend_from_slice(&(self.kind as u32).to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Split a received payload into `expected` arguments. The final
    /// argument is free-form and may itself contain NUL bytes only when it
    /// is opaque job data, so splitting is capped at `expected` pieces.
    pub fn decode_body(kind: PacketKind, body: &[u8], expected: usize) -> Result<Self, ProtocolError> {
        if expected == 0 {
            return Ok(Self { kind, args: Vec::new() });
        }

        let mut args: Vec<Vec<u8>> = Vec::with_capacity(expected);
        let mut rest = body;
        for _ in 0..expected - 1 {
            match rest.iter().position(|&b| b == 0) {
                Some(idx) => {
                    args.push(rest[..idx].to_vec());
                    rest = &rest[idx + 1..];
                }
                None => return Err(ProtocolError::BadArgCount(kind, args.len(), expected)),
            }
        }
        args.push(rest.to_vec());
        Ok(Self { kind, args })
    }

    fn arg_str(&self, idx: usize) -> String {
        self.args
            .get(idx)
            .map(|a| String::from_utf8_lossy(a).to_string())
            .unwrap_or_default()
    }
}

fn expected_args(kind: PacketKind) -> usize {
    match kind {
        PacketKind::Noop | PacketKind::NoJob => 0,
        PacketKind::JobCreated | PacketKind::WorkFail | PacketKind::EchoRes => 1,
        PacketKind::Error
        | PacketKind::WorkComplete
        | PacketKind::WorkData
        | PacketKind::WorkWarning
        | PacketKind::WorkException => 2,
        PacketKind::JobAssign | PacketKind::WorkStatus => 3,
        // Request-only kinds never arrive from the broker.
        _ => 0,
    }
}

fn read_packet(stream: &mut TcpStream) -> Result<Packet> {
    let mut header = [0u8; 12];
    stream
        .read_exact(&mut header)
        .context("failed to read packet header from broker")?;

    let magic: [u8; 4] = header[0..4].try_into().unwrap_or([0; 4]);
    if &magic != MAGIC_RES && &magic != MAGIC_REQ {
        bail!(ProtocolError::BadMagic(magic));
    }

    let code = u32::from_be_bytes(header[4..8].try_into().unwrap_or([0; 4]));
    let size = u32::from_be_bytes(header[8..12].try_into().unwrap_or([0; 4])) as usize;

    let mut body = vec![0u8; size];
    stream
        .read_exact(&mut body)
        .context("failed to read packet body from broker")?;

    let kind = PacketKind::from_code(code)?;
    let packet = Packet::decode_body(kind, &body, expected_args(kind))?;

    if packet.kind == PacketKind::Error {
        bail!(ProtocolError::Broker {
            code: packet.arg_str(0),
            message: packet.arg_str(1),
        });
    }

    Ok(packet)
}

fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    stream
        .write_all(&packet.encode())
        .context("failed to write packet to broker")
}

fn unique_id() -> String {
    let tag: u64 = rand::thread_rng().r#gen();
    format!("{}-{tag:016x}", std::process::id())
}

/// Result of a foreground job submission.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub handle: String,
    pub data: Option<String>,
    pub failed: bool,
}

/// Submit side of the broker connection.
pub struct BrokerClient {
    stream: TcpStream,
    /// WORK_* packets that arrived while waiting for a JOB_CREATED; they
    /// belong to jobs submitted earlier on this connection.
    pending: Vec<Packet>,
}

impl BrokerClient {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("failed to connect to job broker at {addr}"))?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream,
            pending: Vec::new(),
        })
    }

    fn submit_packet(&mut self, kind: PacketKind, function: &str, payload: &str) -> Result<String> {
        let unique = unique_id();
        write_packet(
            &mut self.stream,
            &Packet::new(kind, &[function.as_bytes(), unique.as_bytes(), payload.as_bytes()]),
        )?;

        loop {
            let packet = read_packet(&mut self.stream)?;
            if packet.kind == PacketKind::JobCreated {
                return Ok(packet.arg_str(0));
            }
            self.pending.push(packet);
        }
    }

    /// Fire-and-forget submission. Returns the broker job handle.
    pub fn submit_background(&mut self, function: &str, payload: &str) -> Result<String> {
        self.submit_packet(PacketKind::SubmitJobBg, function, payload)
    }

    /// Submit and wait for the job to complete.
    pub fn submit(&mut self, function: &str, payload: &str) -> Result<JobOutcome> {
        let handle = self.submit_packet(PacketKind::SubmitJob, function, payload)?;
        let mut outcomes = self.wait_for(&[handle])?;
        Ok(outcomes.remove(0))
    }

    /// Submit several jobs concurrently and wait until every one completes.
    pub fn submit_many(&mut self, jobs: &[(String, String)]) -> Result<Vec<JobOutcome>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (function, payload) in jobs {
            handles.push(self.submit_packet(PacketKind::SubmitJob, function, payload)?);
        }
        self.wait_for(&handles)
    }

    fn wait_for(&mut self, handles: &[String]) -> Result<Vec<JobOutcome>> {
        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; handles.len()];
        let mut remaining = handles.len();
        let mut buffered = std::mem::take(&mut self.pending).into_iter();

        while remaining > 0 {
            let packet = match buffered.next() {
                Some(packet) => packet,
                None => read_packet(&mut self.stream)?,
            };
            let (failed, data) = match packet.kind {
                PacketKind::WorkComplete => (false, Some(packet.arg_str(1))),
                PacketKind::WorkFail | PacketKind::WorkException => (true, None),
                // Progress and warning traffic for in-flight jobs.
                _ => continue,
            };

            let handle = packet.arg_str(0);
            if let Some(idx) = handles.iter().position(|h| *h == handle)
                && outcomes[idx].is_none()
            {
                outcomes[idx] = Some(JobOutcome { handle, data, failed });
                remaining -= 1;
            }
        }

        Ok(outcomes.into_iter().flatten().collect())
    }
}

/// A job handed to a worker by the broker.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: String,
    pub function: String,
    pub payload: String,
}

/// Subscribe side of the broker connection: register task names, then pull
/// jobs one at a time.
pub struct WorkerSession {
    stream: TcpStream,
}

impl WorkerSession {
    pub fn connect(addr: &str, client_id: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("failed to connect to job broker at {addr}"))?;
        stream.set_nodelay(true).ok();
        let mut session = Self { stream };
        write_packet(
            &mut session.stream,
            &Packet::new(PacketKind::SetClientId, &[client_id.as_bytes()]),
        )?;
        Ok(session)
    }

    /// Register interest in a task name.
    pub fn register(&mut self, function: &str) -> Result<()> {
        write_packet(
            &mut self.stream,
            &Packet::new(PacketKind::CanDo, &[function.as_bytes()]),
        )
    }

    /// Block until the broker assigns a job, or `quit` is set. The
    /// grab/sleep loop wakes at least once per second to check the flag.
    pub fn next_job(&mut self, quit: &AtomicBool) -> Result<Option<Job>> {
        loop {
            if quit.load(Ordering::SeqCst) {
                return Ok(None);
            }

            write_packet(&mut self.stream, &Packet::new(PacketKind::GrabJob, &[]))?;

            let packet = self.read_blocking(quit)?;
            let Some(packet) = packet else {
                return Ok(None);
            };

            match packet.kind {
                PacketKind::JobAssign => {
                    return Ok(Some(Job {
                        handle: packet.arg_str(0),
                        function: packet.arg_str(1),
                        payload: packet.arg_str(2),
                    }));
                }
                PacketKind::NoJob => {
                    write_packet(&mut self.stream, &Packet::new(PacketKind::PreSleep, &[]))?;
                    // Wait for NOOP (or quit); any other packet restarts the
                    // grab loop.
                    if self.read_blocking(quit)?.is_none() {
                        return Ok(None);
                    }
                }
                _ => {}
            }
        }
    }

    /// Read one packet, polling `quit` on timeout.
    fn read_blocking(&mut self, quit: &AtomicBool) -> Result<Option<Packet>> {
        self.stream
            .set_read_timeout(Some(IDLE_READ_TIMEOUT))
            .context("failed to set broker read timeout")?;

        loop {
            if quit.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match read_packet(&mut self.stream) {
                Ok(packet) => return Ok(Some(packet)),
                Err(err) => {
                    let timed_out = err.downcast_ref::<std::io::Error>().is_some_and(|io| {
                        matches!(
                            io.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        )
                    });
                    if !timed_out {
                        return Err(err);
                    }
                }
            }
        }
    }

    pub fn send_status(&mut self, handle: &str, numerator: u64, denominator: u64) -> Result<()> {
        write_packet(
            &mut self.stream,
            &Packet::new(
                PacketKind::WorkStatus,
                &[
                    handle.as_bytes(),
                    numerator.to_string().as_bytes(),
                    denominator.to_string().as_bytes(),
                ],
            ),
        )
    }

    pub fn send_data(&mut self, handle: &str, data: &str) -> Result<()> {
        write_packet(
            &mut self.stream,
            &Packet::new(PacketKind::WorkData, &[handle.as_bytes(), data.as_bytes()]),
        )
    }

    pub fn send_complete(&mut self, handle: &str, data: &str) -> Result<()> {
        write_packet(
            &mut self.stream,
            &Packet::new(PacketKind::WorkComplete, &[handle.as_bytes(), data.as_bytes()]),
        )
    }

    pub fn send_fail(&mut self, handle: &str) -> Result<()> {
        write_packet(
            &mut self.stream,
            &Packet::new(PacketKind::WorkFail, &[handle.as_bytes()]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn packet_encodes_header_and_args() {
        let packet = Packet::new(
            PacketKind::SubmitJobBg,
            &[b"updateMD5Summary", b"u-1", b"{}"],
        );
        let bytes = packet.encode();
        assert_eq!(&bytes[0..4], b"\0REQ");
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 18);
        let body_len = u32::from_be_bytes(bytes[8..12].try_into().unwrap()) as usize;
        assert_eq!(body_len, bytes.len() - 12);
        assert_eq!(&bytes[12..], b"updateMD5Summary\0u-1\0{}");
    }

    #[test]
    fn decode_splits_fixed_args_and_keeps_tail_opaque() {
        let body = b"H:ship:42\0runCollectionSystemTransfer\0{\"a\":\"b\0c\"}";
        let packet = Packet::decode_body(PacketKind::JobAssign, body, 3).unwrap();
        assert_eq!(packet.arg_str(0), "H:ship:42");
        assert_eq!(packet.arg_str(1), "runCollectionSystemTransfer");
        assert_eq!(packet.args[2], b"{\"a\":\"b\0c\"}");
    }

    #[test]
    fn decode_rejects_short_body() {
        let err = Packet::decode_body(PacketKind::WorkStatus, b"only-handle", 3).unwrap_err();
        assert!(matches!(err, ProtocolError::BadArgCount(_, _, 3)));
    }

    #[test]
    fn unknown_packet_type_is_rejected() {
        assert!(matches!(
            PacketKind::from_code(9999),
            Err(ProtocolError::UnknownType(9999))
        ));
    }

    /// Minimal in-process broker good for one worker connection.
    fn fake_broker<F>(script: F) -> (String, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(stream);
        });
        (addr, handle)
    }

    fn read_req(stream: &mut TcpStream) -> (u32, Vec<u8>) {
        let mut header = [0u8; 12];
        stream.read_exact(&mut header).unwrap();
        let code = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let size = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let mut body = vec![0u8; size];
        stream.read_exact(&mut body).unwrap();
        (code, body)
    }

    fn write_res(stream: &mut TcpStream, code: u32, body: &[u8]) {
        let mut out = Vec::new();
        out.extend_from_slice(b"\0RES");
        out.extend_from_slice(&code.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        stream.write_all(&out).unwrap();
    }

    #[test]
    fn submit_background_returns_handle() {
        let (addr, broker) = fake_broker(|mut stream| {
            let (code, body) = read_req(&mut stream);
            assert_eq!(code, 18);
            assert!(body.starts_with(b"runShipToShoreTransfer\0"));
            write_res(&mut stream, 8, b"H:ship:1");
        });

        let mut client = BrokerClient::connect(&addr).unwrap();
        let handle = client.submit_background("runShipToShoreTransfer", "{}").unwrap();
        assert_eq!(handle, "H:ship:1");
        broker.join().unwrap();
    }

    #[test]
    fn submit_waits_for_completion_through_status_noise() {
        let (addr, broker) = fake_broker(|mut stream| {
            let (code, _) = read_req(&mut stream);
            assert_eq!(code, 7);
            write_res(&mut stream, 8, b"H:ship:2");
            write_res(&mut stream, 12, b"H:ship:2\x005\x0010");
            write_res(&mut stream, 13, b"H:ship:2\0{\"parts\":[]}");
        });

        let mut client = BrokerClient::connect(&addr).unwrap();
        let outcome = client.submit("setupNewCruise", "{}").unwrap();
        assert!(!outcome.failed);
        assert_eq!(outcome.data.as_deref(), Some("{\"parts\":[]}"));
        broker.join().unwrap();
    }

    #[test]
    fn worker_session_grab_sleep_assign_cycle() {
        let (addr, broker) = fake_broker(|mut stream| {
            // SET_CLIENT_ID, CAN_DO
            assert_eq!(read_req(&mut stream).0, 22);
            assert_eq!(read_req(&mut stream).0, 1);
            // GRAB_JOB -> NO_JOB, expect PRE_SLEEP then wake with NOOP
            assert_eq!(read_req(&mut stream).0, 9);
            write_res(&mut stream, 10, b"");
            assert_eq!(read_req(&mut stream).0, 4);
            write_res(&mut stream, 6, b"");
            // Second GRAB_JOB -> JOB_ASSIGN
            assert_eq!(read_req(&mut stream).0, 9);
            write_res(&mut stream, 11, b"H:ship:3\0stopJob\0{\"pid\":\"77\"}");
            // WORK_COMPLETE from the worker
            let (code, body) = read_req(&mut stream);
            assert_eq!(code, 13);
            assert!(body.starts_with(b"H:ship:3\0"));
        });

        let quit = AtomicBool::new(false);
        let mut session = WorkerSession::connect(&addr, "purser-test").unwrap();
        session.register("stopJob").unwrap();

        let job = session.next_job(&quit).unwrap().unwrap();
        assert_eq!(job.handle, "H:ship:3");
        assert_eq!(job.function, "stopJob");
        assert_eq!(job.payload, "{\"pid\":\"77\"}");

        session.send_complete(&job.handle, "{\"parts\":[]}").unwrap();
        broker.join().unwrap();
    }

    #[test]
    fn next_job_returns_none_on_quit() {
        let (addr, broker) = fake_broker(|mut stream| {
            // Drain whatever the worker sends until it disconnects.
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });

        let quit = AtomicBool::new(true);
        let mut session = WorkerSession::connect(&addr, "purser-test").unwrap();
        assert!(session.next_job(&quit).unwrap().is_none());
        drop(session);
        broker.join().unwrap();
    }
}
