//! Shared test double for the serial channel.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use tcengine::codec::{decode_command_payload, DecodeStep, FrameDecoder, FrameKind};
use tcengine::{ArgValue, SerialChannel, TcmdId};

/// Install a capturing subscriber so session logs land in test output.
/// Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// What the scripted channel does with one decoded command frame.
pub type Responder = Box<dyn FnMut(u16, TcmdId, Vec<ArgValue>) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct ScriptState {
    /// Chunks queued for delivery to the session.
    rx: VecDeque<Vec<u8>>,
    /// Raw frames the session wrote, in order.
    tx_log: Vec<Vec<u8>>,
    /// Sends to swallow before the responder starts answering.
    drop_sends: usize,
    dropped: usize,
}

/// Scripted in-memory serial channel.
///
/// Every frame the session sends is decoded and logged; unless the send is
/// dropped, the responder produces the chunks to queue for `recv`. The
/// handle side lets tests inject arbitrary bytes and inspect traffic.
pub struct ScriptedChannel {
    state: Arc<Mutex<ScriptState>>,
    notify: Arc<Notify>,
    responder: Responder,
    decoder: FrameDecoder,
}

/// Test-side handle onto a [`ScriptedChannel`].
#[derive(Clone)]
pub struct ChannelHandle {
    state: Arc<Mutex<ScriptState>>,
    notify: Arc<Notify>,
}

impl ScriptedChannel {
    pub fn new(responder: Responder) -> (Self, ChannelHandle) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        let notify = Arc::new(Notify::new());
        let handle = ChannelHandle {
            state: Arc::clone(&state),
            notify: Arc::clone(&notify),
        };
        (
            Self {
                state,
                notify,
                responder,
                decoder: FrameDecoder::new(),
            },
            handle,
        )
    }

    /// A channel whose remote never answers anything.
    pub fn silent() -> (Self, ChannelHandle) {
        Self::new(Box::new(|_, _, _| Vec::new()))
    }

    /// A channel that answers every command with a success frame carrying
    /// the command id back as a single `U16` field, after dropping the
    /// first `drop_sends` sends entirely.
    pub fn echoing(drop_sends: usize) -> (Self, ChannelHandle) {
        let (channel, handle) = Self::new(Box::new(|seq, id, _args| {
            vec![tcengine::codec::encode_response(seq, 0, &[ArgValue::U16(id.0)])
                .expect("encode echo response")]
        }));
        handle.state.lock().unwrap().drop_sends = drop_sends;
        (channel, handle)
    }
}

impl SerialChannel for ScriptedChannel {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut replies = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.tx_log.push(bytes.to_vec());

            if state.dropped < state.drop_sends {
                state.dropped += 1;
                return Ok(());
            }

            self.decoder.feed(bytes);
            loop {
                match self.decoder.next_frame() {
                    DecodeStep::NeedMoreData => break,
                    DecodeStep::Corrupt(kind) => panic!("session sent corrupt frame: {kind}"),
                    DecodeStep::Frame(frame) => {
                        assert_eq!(frame.kind, FrameKind::Command);
                        let (id, args) =
                            decode_command_payload(&frame.payload).expect("command payload");
                        replies.extend((self.responder)(frame.seq, id, args));
                    }
                }
            }
            for reply in replies {
                state.rx.push_back(reply);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(chunk) = self.state.lock().unwrap().rx.pop_front() {
                return Ok(chunk);
            }
            notified.await;
        }
    }

    async fn close(&mut self) {}
}

impl ChannelHandle {
    /// Queue raw bytes for delivery to the session.
    pub fn inject(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().rx.push_back(bytes);
        self.notify.notify_waiters();
    }

    /// Frames the session has written so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().tx_log.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().tx_log.len()
    }
}

/// A channel that fails every operation, for ChannelError paths.
pub struct BrokenChannel;

impl SerialChannel for BrokenChannel {
    async fn send(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unplugged"))
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unplugged"))
    }

    async fn close(&mut self) {}
}
