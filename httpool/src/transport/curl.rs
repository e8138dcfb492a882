//! libcurl transport engine.
//!
//! Built on the multi "socket" interface: libcurl tells the engine which
//! sockets to watch and when to fire its timer through the socket and timer
//! callbacks, which only queue [`EngineRequest`]s. The pool applies them to
//! its reactor and drives the engine back with `curl_multi_socket_action`.

use super::{
    Completion, EngineRequest, LOW_SPEED_LIMIT, LOW_SPEED_TIME, MAX_REDIRECTS, Method, Request,
    TransferReport, TransportEngine,
};
use crate::error::{DriveError, Error, SubmitError};
use crate::handle::HandleId;
use crate::reactor::{Readiness, SocketAction, SourceToken, TimerRequest};

use curl::easy::{Easy2, Handler, List, WriteError};
use curl::multi::{Easy2Handle, Events, Multi, SocketEvents};
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Accumulates a transfer's response.
#[derive(Default)]
struct Collector {
    body: Vec<u8>,
    headers: Vec<u8>,
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        self.headers.extend_from_slice(data);
        true
    }
}

type RequestQueue = Arc<Mutex<Vec<EngineRequest>>>;

/// [`TransportEngine`] backed by a libcurl multi session.
pub struct CurlEngine {
    /// Must be dropped before `multi`: removing a handle calls back into the
    /// timer function the session owns.
    handles: HashMap<HandleId, Easy2Handle<Collector>>,
    multi: Multi,

    /// Filled by the multi session's socket and timer callbacks.
    requests: RequestQueue,
    completions: VecDeque<Completion>,
}

impl CurlEngine {
    pub fn new() -> Result<Self, Error> {
        let mut multi = Multi::new();
        let requests: RequestQueue = Arc::new(Mutex::new(Vec::new()));

        let queue = Arc::clone(&requests);
        multi
            .socket_function(move |fd, events, token| {
                let request = EngineRequest::Socket {
                    fd,
                    action: socket_action(&events),
                    token: (token != 0).then_some(SourceToken(token as u64)),
                };
                push(&queue, request);
            })
            .map_err(|e| Error::Engine(e.to_string()))?;

        let queue = Arc::clone(&requests);
        multi
            .timer_function(move |timeout| {
                let request = match timeout {
                    Some(delay) => TimerRequest::Arm(delay),
                    None => TimerRequest::Disarm,
                };
                push(&queue, EngineRequest::Timer(request));
                true
            })
            .map_err(|e| Error::Engine(e.to_string()))?;

        Ok(Self {
            handles: HashMap::new(),
            multi,
            requests,
            completions: VecDeque::new(),
        })
    }

    /// Moves the multi session's finished transfers to the completion queue.
    fn collect_messages(&mut self) {
        let mut finished = Vec::new();

        self.multi.messages(|message| {
            if let (Ok(token), Some(result)) = (message.token(), message.result()) {
                finished.push((HandleId(token as u64), result));
            }
        });

        for (id, result) in finished {
            let Some(handle) = self.handles.remove(&id) else {
                continue;
            };

            let report = match self.multi.remove2(handle) {
                Ok(mut easy) => report(&mut easy, result.map_err(|e| e.to_string())),
                Err(e) => TransferReport {
                    error: Some(e.to_string()),
                    ..TransferReport::default()
                },
            };

            debug!(%id, status = report.status, "transfer finished");
            self.completions.push_back(Completion { id, report });
        }
    }
}

impl TransportEngine for CurlEngine {
    fn add(&mut self, id: HandleId, request: &Request) -> Result<(), SubmitError> {
        let easy = configure(request).map_err(|e| SubmitError::Rejected(e.to_string()))?;

        let mut handle = self
            .multi
            .add2(easy)
            .map_err(|e| SubmitError::Rejected(e.to_string()))?;

        handle
            .set_token(id.0 as usize)
            .map_err(|e| SubmitError::Rejected(e.to_string()))?;

        self.handles.insert(id, handle);
        Ok(())
    }

    fn perform(&mut self, _id: HandleId, request: &Request) -> TransferReport {
        let mut easy = match configure(request) {
            Ok(easy) => easy,
            Err(e) => {
                return TransferReport {
                    error: Some(e.to_string()),
                    ..TransferReport::default()
                };
            }
        };

        let result = easy.perform().map_err(|e| e.to_string());
        report(&mut easy, result)
    }

    fn drive_socket(&mut self, fd: RawFd, readiness: Readiness) -> Result<(), DriveError> {
        let mut events = Events::new();
        events
            .input(readiness.readable)
            .output(readiness.writable)
            .error(readiness.error);

        let running = self
            .multi
            .action(fd, &events)
            .map_err(|e| DriveError::new(e.to_string()))?;
        trace!(fd, running, "socket action");

        self.collect_messages();
        Ok(())
    }

    fn drive_timeout(&mut self) -> Result<(), DriveError> {
        let running = self
            .multi
            .timeout()
            .map_err(|e| DriveError::new(e.to_string()))?;
        trace!(running, "timeout action");

        self.collect_messages();
        Ok(())
    }

    fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    fn remove(&mut self, id: HandleId) -> Result<(), DriveError> {
        let Some(handle) = self.handles.remove(&id) else {
            return Ok(());
        };

        self.multi
            .remove2(handle)
            .map(drop)
            .map_err(|e| DriveError::new(e.to_string()).affecting([id]))
    }

    fn assign(&mut self, fd: RawFd, token: SourceToken) -> Result<(), DriveError> {
        self.multi
            .assign(fd, token.0 as usize)
            .map_err(|e| DriveError::new(e.to_string()))
    }

    fn take_requests(&mut self, requests: &mut Vec<EngineRequest>) {
        let mut queue = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        requests.append(&mut queue);
    }
}

impl Drop for CurlEngine {
    fn drop(&mut self) {
        for (id, handle) in self.handles.drain() {
            if let Err(e) = self.multi.remove2(handle) {
                debug!(%id, error = %e, "failed to remove transfer on drop");
            }
        }
    }
}

fn push(queue: &RequestQueue, request: EngineRequest) {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(request);
}

fn socket_action(events: &SocketEvents) -> SocketAction {
    if events.remove() {
        SocketAction::Remove
    } else if events.input_and_output() {
        SocketAction::InOut
    } else if events.input() {
        SocketAction::In
    } else {
        SocketAction::Out
    }
}

/// Builds an easy handle for `request` with the pool's fixed policy.
fn configure(request: &Request) -> Result<Easy2<Collector>, curl::Error> {
    let mut easy = Easy2::new(Collector::default());
    let options = &request.options;

    easy.url(&request.url)?;
    easy.signal(false)?;
    easy.progress(false)?;
    easy.follow_location(true)?;
    easy.max_redirections(MAX_REDIRECTS)?;
    easy.low_speed_time(LOW_SPEED_TIME)?;
    easy.low_speed_limit(LOW_SPEED_LIMIT)?;
    easy.verbose(options.verbose)?;

    if let Some(timeout) = options.timeout {
        easy.timeout(timeout)?;
    }

    easy.ssl_verify_peer(options.verify_tls)?;
    easy.ssl_verify_host(options.verify_tls)?;

    if let Some(cert) = &options.client_cert {
        easy.ssl_cert(cert)?;
    }
    if let Some(key) = &options.client_key {
        easy.ssl_key(key)?;
    }
    if let Some(ca) = &options.ca_file {
        easy.cainfo(ca)?;
    }
    if let Some(proxy) = &options.proxy {
        easy.proxy(proxy)?;
    }
    if let Some((username, password)) = &options.credentials {
        easy.username(username)?;
        easy.password(password)?;
    }

    match (&request.body, request.method) {
        (Some(body), _) => {
            easy.post(true)?;
            easy.post_fields_copy(body)?;
        }
        (None, Method::Post) => {
            easy.post(true)?;
            easy.post_field_size(0)?;
        }
        (None, Method::Get) => {}
    }

    let mut headers = List::new();
    for line in request.header_lines() {
        headers.append(&line)?;
    }
    easy.http_headers(headers)?;

    Ok(easy)
}

/// Reads the completion fields of a finished transfer.
fn report(easy: &mut Easy2<Collector>, result: Result<(), String>) -> TransferReport {
    let status = easy.response_code().map(i64::from).unwrap_or(0);
    let length = easy.download_size().map(|n| n as u64).unwrap_or(0);
    let content_type = easy.content_type().ok().flatten().map(str::to_owned);

    let collector = easy.get_mut();

    TransferReport {
        status,
        length,
        content_type,
        body: mem::take(&mut collector.body),
        headers: mem::take(&mut collector.headers),
        error: result.err(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_a_request_arms_the_timer() {
        let mut engine = CurlEngine::new().unwrap();
        engine
            .add(HandleId(1), &Request::get("http://127.0.0.1:1/"))
            .unwrap();

        let mut requests = Vec::new();
        engine.take_requests(&mut requests);

        assert!(requests
            .iter()
            .any(|r| matches!(r, EngineRequest::Timer(TimerRequest::Arm(_)))));
    }

    #[test]
    fn dropping_engine_with_transfer_in_flight() {
        let mut engine = CurlEngine::new().unwrap();
        engine
            .add(HandleId(1), &Request::get("http://127.0.0.1:1/"))
            .unwrap();
        engine
            .add(HandleId(2), &Request::get("http://127.0.0.1:1/other"))
            .unwrap();

        drop(engine);
    }

    #[test]
    fn removing_a_request_after_adding_it() {
        let mut engine = CurlEngine::new().unwrap();
        engine
            .add(HandleId(1), &Request::get("http://127.0.0.1:1/"))
            .unwrap();

        engine.remove(HandleId(1)).unwrap();
        assert!(engine.handles.is_empty());
    }

    #[test]
    fn refused_connection_is_reported_as_failure() {
        let mut engine = CurlEngine::new().unwrap();

        let report = engine.perform(HandleId(1), &Request::get("http://127.0.0.1:1/"));

        assert_eq!(report.status, 0);
        assert!(report.error.is_some());
    }

    #[test]
    fn removing_unknown_request_is_harmless() {
        let mut engine = CurlEngine::new().unwrap();
        assert!(engine.remove(HandleId(9)).is_ok());
    }
}
