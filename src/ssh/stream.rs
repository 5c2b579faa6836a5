// ABOUTME: Remote command execution with line-by-line streaming.
// ABOUTME: A spawned task merges stdout and stderr into one ordered queue of lines.

use super::client::{Session, SessionCloser};
use super::error::{Error, Result};
use super::params::ConnectionParameters;
use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lines buffered between the reader task and the consumer.
const LINE_QUEUE_DEPTH: usize = 64;

const PTY_TERM: &str = "xterm";
const PTY_COLS: u32 = 80;
const PTY_ROWS: u32 = 24;

/// Extended data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Which remote output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputKind {
    Stdout,
    Stderr,
}

/// Something observed on a running command's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutputEvent {
    Data(OutputKind, Bytes),
    Exit(u32),
    Signal(String),
}

/// Source of output events for the reader task.
#[async_trait]
pub(crate) trait OutputSource: Send {
    /// Next event in arrival order, or `None` once the command's output has ended.
    async fn next_event(&mut self) -> Option<OutputEvent>;

    /// Release the underlying connection.
    async fn close(&mut self);
}

/// How a streamed command ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Exit status reported by the server, if any.
    pub exit_status: Option<u32>,
    /// Why the stream ended abnormally, if it did.
    pub error: Option<String>,
}

impl Completion {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0) && self.error.is_none()
    }
}

/// Splits a byte stream into lines, dropping a `\r` before each `\n`.
#[derive(Debug, Default)]
struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buf[start..end]));
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Whatever trails the last newline.
    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = decode_line(&self.buf);
        self.buf.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Lines produced by a remote command.
///
/// Stdout and stderr lines are interleaved in the order the server's
/// messages arrive; no ordering between the two streams is promised beyond
/// that. A line is never assembled from bytes of both streams.
///
/// The queue closes once the command's output ends; [`CommandStream::finish`]
/// then reports how it ended. Dropping the stream early is supported only
/// as abandonment: the reader task stops and closes the connection, and
/// the remote command's outcome is lost.
pub struct CommandStream {
    lines: mpsc::Receiver<String>,
    task: JoinHandle<Completion>,
}

impl CommandStream {
    pub(crate) fn spawn<S>(source: S) -> Self
    where
        S: OutputSource + 'static,
    {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_DEPTH);
        let task = tokio::spawn(read_lines(source, tx));
        Self { lines: rx, task }
    }

    /// Next line, or `None` once the command's output has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Discard any unread lines and wait for the command to end.
    pub async fn finish(mut self) -> Result<Completion> {
        while self.lines.recv().await.is_some() {}
        self.task.await.map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    /// Read every line, each followed by `\n`, then wait for the command to end.
    pub async fn collect_output(mut self) -> Result<(String, Completion)> {
        let mut output = String::new();
        while let Some(line) = self.lines.recv().await {
            output.push_str(&line);
            output.push('\n');
        }
        let completion = self.finish().await?;
        Ok((output, completion))
    }
}

impl futures::Stream for CommandStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.lines.poll_recv(cx)
    }
}

/// Reader task: forward lines until the source ends, then close it.
async fn read_lines<S: OutputSource>(mut source: S, tx: mpsc::Sender<String>) -> Completion {
    let mut stdout = LineSplitter::default();
    let mut stderr = LineSplitter::default();
    let mut completion = Completion::default();
    let mut consumer_gone = false;

    'events: while let Some(event) = source.next_event().await {
        match event {
            OutputEvent::Data(kind, chunk) => {
                let splitter = match kind {
                    OutputKind::Stdout => &mut stdout,
                    OutputKind::Stderr => &mut stderr,
                };
                for line in splitter.push(&chunk) {
                    if tx.send(line).await.is_err() {
                        consumer_gone = true;
                        break 'events;
                    }
                }
            }
            OutputEvent::Exit(status) => completion.exit_status = Some(status),
            OutputEvent::Signal(name) => {
                completion.error = Some(format!("command terminated by signal {name}"));
            }
        }
    }

    if consumer_gone {
        tracing::debug!("line consumer dropped, abandoning command");
        completion.error = Some("stream abandoned by consumer".to_string());
    } else {
        for line in [stdout.finish(), stderr.finish()].into_iter().flatten() {
            if tx.send(line).await.is_err() {
                break;
            }
        }
        if completion.exit_status.is_none() && completion.error.is_none() {
            completion.error = Some("channel closed without exit status".to_string());
        }
    }

    drop(tx);
    source.close().await;
    completion
}

/// Output events read from a live session channel.
struct ChannelSource {
    channel: Channel<Msg>,
    closer: SessionCloser,
    /// Messages that arrived while waiting for request replies.
    pending: VecDeque<ChannelMsg>,
    got_eof: bool,
    got_exit: bool,
}

#[async_trait]
impl OutputSource for ChannelSource {
    async fn next_event(&mut self) -> Option<OutputEvent> {
        loop {
            if self.got_eof && self.got_exit {
                return None;
            }
            let msg = match self.pending.pop_front() {
                Some(msg) => Some(msg),
                None => self.channel.wait().await,
            };
            match msg {
                Some(ChannelMsg::Data { data }) => {
                    return Some(OutputEvent::Data(
                        OutputKind::Stdout,
                        Bytes::copy_from_slice(&data),
                    ));
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == SSH_EXTENDED_DATA_STDERR {
                        return Some(OutputEvent::Data(
                            OutputKind::Stderr,
                            Bytes::copy_from_slice(&data),
                        ));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    self.got_exit = true;
                    return Some(OutputEvent::Exit(exit_status));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    self.got_exit = true;
                    return Some(OutputEvent::Signal(format!("{signal_name:?}")));
                }
                Some(ChannelMsg::Eof) => self.got_eof = true,
                Some(ChannelMsg::Close) | None => return None,
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        self.closer.close(&self.channel).await;
    }
}

/// Wait for the server's answer to a request sent with `want_reply`.
///
/// Output that arrives first is kept in `pending`.
async fn await_reply(
    channel: &mut Channel<Msg>,
    request: &str,
    pending: &mut VecDeque<ChannelMsg>,
) -> Result<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(Error::StreamSetup(format!("server refused {request}")));
            }
            Some(msg) => pending.push_back(msg),
            None => {
                return Err(Error::StreamSetup(format!(
                    "channel closed before {request} was confirmed"
                )));
            }
        }
    }
}

/// Request a pseudo-terminal and start `command`.
async fn start_command(
    channel: &mut Channel<Msg>,
    command: &str,
) -> Result<VecDeque<ChannelMsg>> {
    let mut pending = VecDeque::new();

    channel
        .request_pty(true, PTY_TERM, PTY_COLS, PTY_ROWS, 0, 0, &[])
        .await
        .map_err(|e| Error::StreamSetup(format!("failed to request pseudo-terminal: {}", e)))?;
    await_reply(channel, "pseudo-terminal", &mut pending).await?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| Error::StreamSetup(format!("failed to exec command: {}", e)))?;
    await_reply(channel, "command start", &mut pending).await?;

    Ok(pending)
}

impl Session {
    /// Start `command` and stream its combined output.
    ///
    /// Consumes the session; it is closed when the output ends.
    pub async fn stream(self, command: &str) -> Result<CommandStream> {
        tracing::debug!("streaming `{}` on {}", command, self.host());
        let (mut channel, closer) = self.into_parts();

        let pending = match start_command(&mut channel, command).await {
            Ok(pending) => pending,
            Err(e) => {
                closer.close(&channel).await;
                return Err(e);
            }
        };

        Ok(CommandStream::spawn(ChannelSource {
            channel,
            closer,
            pending,
            got_eof: false,
            got_exit: false,
        }))
    }

    /// Run `command` and return its combined output, one `\n` per line.
    pub async fn run(self, command: &str) -> Result<String> {
        let (output, completion) = self.stream(command).await?.collect_output().await?;
        if let Some(error) = &completion.error {
            tracing::debug!("`{}` ended abnormally: {}", command, error);
        }
        Ok(output)
    }
}

/// Connect and stream `command`'s output.
pub async fn stream_command(params: &ConnectionParameters, command: &str) -> Result<CommandStream> {
    Session::connect(params).await?.stream(command).await
}

/// Connect and run `command`, returning its combined output.
pub async fn run_command(params: &ConnectionParameters, command: &str) -> Result<String> {
    Session::connect(params).await?.run(command).await
}
