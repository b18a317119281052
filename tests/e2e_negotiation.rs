//! End-to-end negotiation tests.
//!
//! Drive a single [`StreamNegotiator`] attempt against scripted broker and
//! channel collaborators, covering every outcome and failure classification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devstream::error::{FailureKind, Result, StreamError};
use devstream::protocol::{
    AttemptState, Deadline, NegotiationOutcome, StreamNegotiator, StreamRequest, TextTransform,
};
use devstream::transport::{BrokerConnection, ChannelFactory, StreamChannel};
use futures::future::{self, BoxFuture};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted result of a collaborator call
#[derive(Clone, Copy)]
enum Step {
    Ok,
    Hang,
    Fail(fn() -> StreamError),
}

impl Step {
    async fn run(self) -> Result<()> {
        match self {
            Step::Ok => Ok(()),
            Step::Hang => future::pending().await,
            Step::Fail(make) => Err(make()),
        }
    }
}

/// Scripted result of waiting for a request
#[derive(Clone, Copy)]
enum Wait {
    Request,
    Empty,
    Hang,
    Fail(fn() -> StreamError),
}

/// Scripted result of receiving a frame
#[derive(Clone)]
enum Receive {
    Frame(Vec<u8>),
    Hang,
}

fn request() -> StreamRequest {
    StreamRequest::new("req-1", "telemetry", "wss://broker.test/streams/req-1", "tok")
}

#[derive(Default)]
struct Calls {
    accepts: AtomicUsize,
    rejects: AtomicUsize,
    closes: AtomicUsize,
}

struct ScriptedConnection {
    wait: Wait,
    accept: Step,
    reject: Step,
    close: Step,
    calls: Arc<Calls>,
}

impl ScriptedConnection {
    fn new(wait: Wait) -> Self {
        Self {
            wait,
            accept: Step::Ok,
            reject: Step::Ok,
            close: Step::Ok,
            calls: Arc::new(Calls::default()),
        }
    }

    fn closes(&self) -> usize {
        self.calls.closes.load(Ordering::SeqCst)
    }
}

impl BrokerConnection for ScriptedConnection {
    fn wait_for_stream_request(
        &self,
        deadline: Deadline,
    ) -> BoxFuture<'_, Result<Option<StreamRequest>>> {
        Box::pin(async move {
            match self.wait {
                Wait::Request => Ok(Some(request())),
                Wait::Empty => {
                    tokio::time::sleep_until(deadline.instant()).await;
                    Ok(None)
                },
                Wait::Hang => future::pending().await,
                Wait::Fail(make) => Err(make()),
            }
        })
    }

    fn accept_stream_request<'a>(
        &'a self,
        _request: &'a StreamRequest,
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<()>> {
        self.calls.accepts.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.accept.run())
    }

    fn reject_stream_request<'a>(
        &'a self,
        _request: &'a StreamRequest,
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<()>> {
        self.calls.rejects.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.reject.run())
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.close.run())
    }
}

struct ScriptedChannels {
    open: Step,
    receive: Receive,
    send: Step,
    close: Step,
    opened: AtomicUsize,
    dropped: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedChannels {
    fn new(receive: Receive) -> Self {
        Self {
            open: Step::Ok,
            receive,
            send: Step::Ok,
            close: Step::Ok,
            opened: AtomicUsize::new(0),
            dropped: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn frame(payload: &str) -> Self {
        Self::new(Receive::Frame(payload.as_bytes().to_vec()))
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl ChannelFactory for ScriptedChannels {
    fn open_channel<'a>(
        &'a self,
        _url: &'a str,
        authorization_token: &'a str,
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<Box<dyn StreamChannel>>> {
        Box::pin(async move {
            assert_eq!(authorization_token, "tok");
            self.open.run().await?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            let channel: Box<dyn StreamChannel> = Box::new(ScriptedChannel {
                receive: self.receive.clone(),
                send: self.send,
                close: self.close,
                sent: Arc::clone(&self.sent),
                dropped: Arc::clone(&self.dropped),
            });
            Ok(channel)
        })
    }
}

struct ScriptedChannel {
    receive: Receive,
    send: Step,
    close: Step,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    dropped: Arc<AtomicUsize>,
}

impl Drop for ScriptedChannel {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl StreamChannel for ScriptedChannel {
    fn receive<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            match &self.receive {
                Receive::Frame(frame) => {
                    let len = frame.len().min(buffer.len());
                    buffer[..len].copy_from_slice(&frame[..len]);
                    Ok(len)
                },
                Receive::Hang => future::pending().await,
            }
        })
    }

    fn send<'a>(&'a mut self, frame: &'a [u8], _deadline: Deadline) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.send.run().await?;
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        })
    }

    fn close(&mut self, _deadline: Deadline) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.close.run())
    }
}

fn uppercase(msg: &str) -> String {
    msg.to_uppercase()
}

fn failure(outcome: &NegotiationOutcome) -> (FailureKind, AttemptState) {
    match outcome {
        NegotiationOutcome::Failed(failure) => (failure.kind, failure.step),
        other => panic!("Expected a failed outcome, got {other:?}"),
    }
}

fn cancel_after(cancel: &CancellationToken, delay: Duration) {
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn test_no_request_closes_connection_once() {
    let connection = ScriptedConnection::new(Wait::Empty);
    let channels = ScriptedChannels::frame("unused");
    let negotiator = StreamNegotiator::new(&channels, None);

    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(outcome, NegotiationOutcome::NoRequest);
    assert_eq!(connection.closes(), 1);
    assert_eq!(channels.opened(), 0);
    assert!(start.elapsed() >= TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_wait_past_deadline_is_no_request() {
    let connection = ScriptedConnection::new(Wait::Hang);
    let channels = ScriptedChannels::frame("unused");
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(outcome, NegotiationOutcome::NoRequest);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_accepted_exchange_applies_transform() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::frame("hello");
    let transform: &TextTransform<'_> = &uppercase;
    let negotiator = StreamNegotiator::new(&channels, Some(transform));

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        outcome,
        NegotiationOutcome::Exchanged {
            msg_in: "hello".to_string(),
            msg_out: "HELLO".to_string(),
        }
    );
    assert_eq!(channels.sent(), vec![b"HELLO".to_vec()]);
    assert_eq!(connection.calls.accepts.load(Ordering::SeqCst), 1);
    assert_eq!(channels.opened(), 1);
    assert_eq!(channels.dropped(), 1);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exchange_without_transform_echoes() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::frame("ping");
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        outcome,
        NegotiationOutcome::Exchanged {
            msg_in: "ping".to_string(),
            msg_out: "ping".to_string(),
        }
    );
    assert_eq!(channels.sent(), vec![b"ping".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_reject_never_opens_channel() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::frame("unused");
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, false, TIMEOUT).await;

    assert_eq!(
        outcome,
        NegotiationOutcome::Rejected {
            request_id: "req-1".to_string(),
        }
    );
    assert_eq!(connection.calls.rejects.load(Ordering::SeqCst), 1);
    assert_eq!(connection.calls.accepts.load(Ordering::SeqCst), 0);
    assert_eq!(channels.opened(), 0);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_receive_times_out_within_margin() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::new(Receive::Hang);
    let negotiator = StreamNegotiator::new(&channels, None);

    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;
    let elapsed = start.elapsed();

    assert_eq!(
        failure(&outcome),
        (FailureKind::AttemptCancelled, AttemptState::Exchanging)
    );
    assert!(elapsed >= TIMEOUT);
    assert!(elapsed < TIMEOUT + Duration::from_secs(1));
    // The channel is abandoned, never left open
    assert_eq!(channels.dropped(), 1);
    assert!(channels.sent().is_empty());
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_accept_times_out() {
    let mut connection = ScriptedConnection::new(Wait::Request);
    connection.accept = Step::Hang;
    let channels = ScriptedChannels::frame("unused");
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::AttemptCancelled, AttemptState::Accepting)
    );
    assert_eq!(channels.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_wait() {
    let connection = ScriptedConnection::new(Wait::Hang);
    let channels = ScriptedChannels::frame("unused");
    let cancel = CancellationToken::new();
    let negotiator = StreamNegotiator::new(&channels, None).with_cancellation(cancel.clone());

    cancel_after(&cancel, Duration::from_secs(1));
    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::OperationCancelled, AttemptState::Waiting)
    );
    assert!(start.elapsed() < TIMEOUT);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_receive() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::new(Receive::Hang);
    let cancel = CancellationToken::new();
    let negotiator = StreamNegotiator::new(&channels, None).with_cancellation(cancel.clone());

    cancel_after(&cancel, Duration::from_secs(1));
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::OperationCancelled, AttemptState::Exchanging)
    );
    assert_eq!(channels.dropped(), 1);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_message_is_reclassified() {
    let mut connection = ScriptedConnection::new(Wait::Request);
    connection.accept = Step::Fail(|| StreamError::Transport("Operation Timeout".to_string()));
    let channels = ScriptedChannels::frame("unused");
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::AttemptCancelled, AttemptState::Accepting)
    );
}

#[tokio::test(start_paused = true)]
async fn test_broker_unreachable_while_waiting() {
    let connection = ScriptedConnection::new(Wait::Fail(|| {
        StreamError::BrokerUnreachable("connection refused".to_string())
    }));
    let channels = ScriptedChannels::frame("unused");
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::BrokerUnreachable, AttemptState::Waiting)
    );
    assert!(outcome.to_string().contains("connection refused"));
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_stream_target_on_channel_open() {
    let connection = ScriptedConnection::new(Wait::Request);
    let mut channels = ScriptedChannels::frame("unused");
    channels.open = Step::Fail(|| StreamError::DeviceNotFound("no such stream".to_string()));
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::DeviceOrTargetNotFound, AttemptState::Accepting)
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_is_transport_error() {
    let connection = ScriptedConnection::new(Wait::Request);
    let mut channels = ScriptedChannels::frame("hello");
    channels.send = Step::Fail(|| StreamError::Transport("broken pipe".to_string()));
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::TransportError, AttemptState::Exchanging)
    );
    assert_eq!(channels.dropped(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_channel_close_failure_keeps_exchange() {
    let connection = ScriptedConnection::new(Wait::Request);
    let mut channels = ScriptedChannels::frame("hello");
    channels.close = Step::Fail(|| StreamError::Transport("close frame lost".to_string()));
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert!(matches!(outcome, NegotiationOutcome::Exchanged { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_connection_close_is_bounded() {
    let mut connection = ScriptedConnection::new(Wait::Request);
    connection.close = Step::Hang;
    let channels = ScriptedChannels::frame("hello");
    let negotiator = StreamNegotiator::new(&channels, None);

    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert!(matches!(outcome, NegotiationOutcome::Exchanged { .. }));
    assert!(start.elapsed() <= Duration::from_secs(3));
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_utf8_is_decoded_lossily() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::new(Receive::Frame(vec![b'h', 0xff, b'i']));
    let negotiator = StreamNegotiator::new(&channels, None);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        outcome,
        NegotiationOutcome::Exchanged {
            msg_in: "h\u{FFFD}i".to_string(),
            msg_out: "h\u{FFFD}i".to_string(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_frame_truncated_to_receive_buffer() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::frame("abcdefgh");
    let negotiator = StreamNegotiator::new(&channels, None).with_receive_buffer_size(4);

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        outcome,
        NegotiationOutcome::Exchanged {
            msg_in: "abcd".to_string(),
            msg_out: "abcd".to_string(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_frame_is_exchanged() {
    let connection = ScriptedConnection::new(Wait::Request);
    let channels = ScriptedChannels::frame("");
    let transform: &TextTransform<'_> = &uppercase;
    let negotiator = StreamNegotiator::new(&channels, Some(transform));

    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        outcome,
        NegotiationOutcome::Exchanged {
            msg_in: String::new(),
            msg_out: String::new(),
        }
    );
    assert_eq!(channels.sent(), vec![Vec::<u8>::new()]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_send() {
    let connection = ScriptedConnection::new(Wait::Request);
    let mut channels = ScriptedChannels::frame("hello");
    channels.send = Step::Hang;
    let cancel = CancellationToken::new();
    let negotiator = StreamNegotiator::new(&channels, None).with_cancellation(cancel.clone());

    cancel_after(&cancel, Duration::from_secs(1));
    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::OperationCancelled, AttemptState::Exchanging)
    );
    assert!(start.elapsed() < TIMEOUT);
    assert!(channels.sent().is_empty());
    assert_eq!(channels.dropped(), 1);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_send_times_out() {
    let connection = ScriptedConnection::new(Wait::Request);
    let mut channels = ScriptedChannels::frame("hello");
    channels.send = Step::Hang;
    let negotiator = StreamNegotiator::new(&channels, None);

    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;
    let elapsed = start.elapsed();

    assert_eq!(
        failure(&outcome),
        (FailureKind::AttemptCancelled, AttemptState::Exchanging)
    );
    assert!(elapsed >= TIMEOUT);
    assert!(elapsed < TIMEOUT + Duration::from_secs(1));
    assert_eq!(channels.dropped(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_channel_open_times_out() {
    let connection = ScriptedConnection::new(Wait::Request);
    let mut channels = ScriptedChannels::frame("unused");
    channels.open = Step::Hang;
    let negotiator = StreamNegotiator::new(&channels, None);

    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, true, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::AttemptCancelled, AttemptState::Accepting)
    );
    assert!(start.elapsed() < TIMEOUT + Duration::from_secs(1));
    assert_eq!(channels.opened(), 0);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_reject_times_out() {
    let mut connection = ScriptedConnection::new(Wait::Request);
    connection.reject = Step::Hang;
    let channels = ScriptedChannels::frame("unused");
    let negotiator = StreamNegotiator::new(&channels, None);

    let start = Instant::now();
    let outcome = negotiator.negotiate(&connection, false, TIMEOUT).await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::AttemptCancelled, AttemptState::Deciding)
    );
    assert!(start.elapsed() < TIMEOUT + Duration::from_secs(1));
    assert_eq!(channels.opened(), 0);
    assert_eq!(connection.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_timeout_waits_until_cancelled() {
    let connection = ScriptedConnection::new(Wait::Hang);
    let channels = ScriptedChannels::frame("unused");
    let cancel = CancellationToken::new();
    let negotiator = StreamNegotiator::new(&channels, None).with_cancellation(cancel.clone());

    cancel_after(&cancel, Duration::from_secs(3600));
    let outcome = negotiator
        .negotiate(&connection, true, Duration::from_secs(u64::MAX))
        .await;

    assert_eq!(
        failure(&outcome),
        (FailureKind::OperationCancelled, AttemptState::Waiting)
    );
}
