#![allow(dead_code)]

use httpool::reactor::{Readiness, SocketAction, SourceToken, TimerRequest};
use httpool::transport::{Completion, EngineRequest, TransferReport, TransportEngine};
use httpool::{BackendKind, DriveError, HandleId, Request, SubmitError};

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Once;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const BACKENDS: [BackendKind; 3] = [
    BackendKind::RawReactor,
    BackendKind::LoopLibrary,
    BackendKind::ServiceLoop,
];

/// Installs a test subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// One asynchronous transfer: the engine watches `local`, the test writes
/// to `remote` to make it ready.
struct Transfer {
    id: HandleId,
    local: UnixStream,
    remote: UnixStream,
    url: String,

    /// How the transfer ends on its next readiness, if it ends.
    outcome: Option<TransferReport>,
}

/// A transport engine whose transfers finish when the test says so.
///
/// Every transfer owns a socket pair. The engine asks for read interest on
/// its end when the request is added and removes it when the transfer ends.
/// Sockets of finished transfers are kept open until the engine is dropped,
/// so descriptor numbers are never reused during a test.
#[derive(Default)]
pub struct ScriptedEngine {
    transfers: HashMap<HandleId, Transfer>,
    by_fd: HashMap<RawFd, HandleId>,
    retired: Vec<Transfer>,

    requests: Vec<EngineRequest>,
    completions: VecDeque<Completion>,
    tokens: HashMap<RawFd, SourceToken>,

    on_timeout: Vec<(HandleId, TransferReport)>,
    drive_failure: Option<DriveError>,
    reject_next: bool,
    duplicate_completions: bool,

    pub added: Vec<HandleId>,
    pub removed: Vec<HandleId>,
    pub performed: Vec<String>,
    pub socket_drives: usize,
    pub timeouts: usize,
}

pub fn ok(status: i64, body: &str) -> TransferReport {
    TransferReport {
        status,
        length: body.len() as u64,
        content_type: Some("text/plain".to_owned()),
        body: body.as_bytes().to_vec(),
        headers: format!("HTTP/1.1 {status}\r\n").into_bytes(),
        error: None,
    }
}

pub fn failed(error: &str) -> TransferReport {
    TransferReport {
        error: Some(error.to_owned()),
        ..TransferReport::default()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends the transfer of `id` with `report` once its socket is driven.
    pub fn finish(&mut self, id: HandleId, report: TransferReport) {
        let transfer = self.transfers.get_mut(&id).expect("transfer in flight");
        transfer.outcome = Some(report);
        transfer.remote.write_all(b".").unwrap();
    }

    /// Makes the socket of `id` readable without ending the transfer.
    ///
    /// Works on finished transfers too.
    pub fn poke(&mut self, id: HandleId) {
        let transfer = self
            .transfers
            .get_mut(&id)
            .or_else(|| self.retired.iter_mut().find(|t| t.id == id))
            .expect("known transfer");
        transfer.remote.write_all(b".").unwrap();
    }

    /// Ends the transfer of `id` on the next timer expiry.
    pub fn finish_on_timeout(&mut self, id: HandleId, report: TransferReport) {
        self.on_timeout.push((id, report));
    }

    /// Asks the reactor to arm or disarm the engine timer.
    pub fn request_timer(&mut self, request: TimerRequest) {
        self.requests.push(EngineRequest::Timer(request));
    }

    /// Asks the reactor for a new interest on `fd`.
    pub fn request_interest(&mut self, fd: RawFd, action: SocketAction) {
        self.requests.push(EngineRequest::Socket {
            fd,
            action,
            token: self.tokens.get(&fd).copied(),
        });
    }

    /// Closes the engine's end of the socket of `id`, keeping the transfer.
    pub fn close_socket(&mut self, id: HandleId) -> RawFd {
        let transfer = self.transfers.get_mut(&id).expect("transfer in flight");
        let fd = transfer.local.as_raw_fd();

        // Swap in a fresh stream so the old descriptor is really closed.
        let (replacement, _) = UnixStream::pair().unwrap();
        drop(std::mem::replace(&mut transfer.local, replacement));
        fd
    }

    /// The next drive call fails with `reason`, breaking `affected`.
    pub fn fail_next_drive(&mut self, reason: &str, affected: Vec<HandleId>) {
        self.drive_failure = Some(DriveError::new(reason).affecting(affected));
    }

    pub fn reject_next(&mut self) {
        self.reject_next = true;
    }

    /// Reports every completion twice.
    pub fn duplicate_completions(&mut self) {
        self.duplicate_completions = true;
    }

    /// Descriptor the engine watches for `id`.
    pub fn fd(&self, id: HandleId) -> Option<RawFd> {
        self.transfers.get(&id).map(|t| t.local.as_raw_fd())
    }

    pub fn token(&self, fd: RawFd) -> Option<SourceToken> {
        self.tokens.get(&fd).copied()
    }

    fn complete(&mut self, id: HandleId, report: TransferReport) {
        let Some(transfer) = self.transfers.remove(&id) else {
            return;
        };
        let fd = transfer.local.as_raw_fd();

        self.requests.push(EngineRequest::Socket {
            fd,
            action: SocketAction::Remove,
            token: self.tokens.remove(&fd),
        });
        self.retired.push(transfer);

        if self.duplicate_completions {
            self.completions.push_back(Completion {
                id,
                report: report.clone(),
            });
        }
        self.completions.push_back(Completion { id, report });
    }

    fn check_failure(&mut self) -> Result<(), DriveError> {
        match self.drive_failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl TransportEngine for ScriptedEngine {
    fn add(&mut self, id: HandleId, request: &Request) -> Result<(), SubmitError> {
        if std::mem::take(&mut self.reject_next) {
            return Err(SubmitError::Rejected("too many handles".to_owned()));
        }

        let (local, remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let fd = local.as_raw_fd();

        self.requests.push(EngineRequest::Socket {
            fd,
            action: SocketAction::In,
            token: None,
        });

        self.by_fd.insert(fd, id);
        self.transfers.insert(
            id,
            Transfer {
                id,
                local,
                remote,
                url: request.url.clone(),
                outcome: None,
            },
        );
        self.added.push(id);
        Ok(())
    }

    fn perform(&mut self, _id: HandleId, request: &Request) -> TransferReport {
        self.performed.push(request.url.clone());
        ok(200, &request.url)
    }

    fn drive_socket(&mut self, fd: RawFd, readiness: Readiness) -> Result<(), DriveError> {
        self.socket_drives += 1;
        self.check_failure()?;

        let Some(&id) = self.by_fd.get(&fd) else {
            return Ok(());
        };
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return Ok(());
        };

        if readiness.readable {
            let mut buf = [0u8; 64];
            loop {
                match transfer.local.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(DriveError::new(e.to_string()).affecting([id])),
                }
            }
        }

        if let Some(report) = transfer.outcome.take() {
            self.complete(id, report);
        }

        Ok(())
    }

    fn drive_timeout(&mut self) -> Result<(), DriveError> {
        self.timeouts += 1;
        self.check_failure()?;

        for (id, report) in std::mem::take(&mut self.on_timeout) {
            self.complete(id, report);
        }

        Ok(())
    }

    fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    fn remove(&mut self, id: HandleId) -> Result<(), DriveError> {
        if let Some(transfer) = self.transfers.remove(&id) {
            let fd = transfer.local.as_raw_fd();

            self.requests.push(EngineRequest::Socket {
                fd,
                action: SocketAction::Remove,
                token: self.tokens.remove(&fd),
            });
            self.retired.push(transfer);
        }

        self.removed.push(id);
        Ok(())
    }

    fn assign(&mut self, fd: RawFd, token: SourceToken) -> Result<(), DriveError> {
        self.tokens.insert(fd, token);
        Ok(())
    }

    fn take_requests(&mut self, requests: &mut Vec<EngineRequest>) {
        requests.append(&mut self.requests);
    }
}
