// ABOUTME: Single-file upload over the scp sink protocol.
// ABOUTME: Runs `scp -t` remotely and feeds it one header line, the file bytes and a terminating NUL.

use super::client::Session;
use super::error::{Error, Result};
use super::params::ConnectionParameters;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Permission token sent in every file header.
const FILE_MODE: &str = "0644";

/// Header announcing one regular file: `C0644 <size> <name>\n`.
fn file_header(len: u64, target: &str) -> String {
    let name = Path::new(target)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.to_string());
    format!("C{} {} {}\n", FILE_MODE, len, name)
}

/// Write header, `len` bytes of `source`, and the terminating NUL.
///
/// `writer` is shut down even when the body fails, so the receiver sees EOF
/// instead of waiting for the bytes it was promised.
async fn write_file<W, R>(writer: &mut W, source: &mut R, len: u64, target: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let sent = write_body(writer, source, len, target).await;
    let closed = writer.shutdown().await;
    sent.and(closed)
}

async fn write_body<W, R>(writer: &mut W, source: &mut R, len: u64, target: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    writer.write_all(file_header(len, target).as_bytes()).await?;

    if len > 0 {
        let copied = tokio::io::copy(&mut source.take(len), writer).await?;
        if copied != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended after {copied} of {len} bytes"),
            ));
        }
    }

    writer.write_all(b"\0").await
}

/// Text the receiver printed, minus its NUL acknowledgements.
fn receiver_message(output: &[u8]) -> String {
    let text: Vec<u8> = output
        .iter()
        .copied()
        .filter(|&b| b != 0 && b != 1 && b != 2)
        .collect();
    String::from_utf8_lossy(&text).trim().to_string()
}

async fn send_file(channel: &mut Channel<Msg>, source: &Path, target: &str) -> Result<()> {
    let mut file = tokio::fs::File::open(source)
        .await
        .map_err(|e| Error::Transfer(format!("failed to open {}: {}", source.display(), e)))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| Error::Transfer(format!("failed to stat {}: {}", source.display(), e)))?
        .len();

    channel
        .exec(true, format!("scp -t {}", target))
        .await
        .map_err(|e| Error::Transfer(format!("failed to start remote receiver: {}", e)))?;

    let mut writer = Box::pin(channel.make_writer());
    let header_target = target.to_string();
    let mut writer_task = tokio::spawn(async move {
        write_file(&mut writer, &mut file, len, &header_target).await
    });

    let send_failed = |e: std::io::Error| {
        Error::Transfer(format!("failed to send {}: {}", source.display(), e))
    };

    let mut output = Vec::new();
    let mut exit_status = None;
    let mut got_eof = false;
    let mut sent = false;

    loop {
        tokio::select! {
            joined = &mut writer_task, if !sent => {
                joined
                    .map_err(|e| Error::Transfer(format!("upload writer failed: {}", e)))?
                    .map_err(send_failed)?;
                sent = true;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => output.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                    if got_eof {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    got_eof = true;
                    if exit_status.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Failure) => {
                    writer_task.abort();
                    return Err(Error::Transfer("server refused to start scp".to_string()));
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }

    match exit_status {
        Some(0) => {}
        Some(status) => {
            writer_task.abort();
            return Err(Error::Transfer(format!(
                "remote scp exited with status {}: {}",
                status,
                receiver_message(&output)
            )));
        }
        None => {
            writer_task.abort();
            return Err(Error::Transfer(
                "channel closed before remote scp reported an exit status".to_string(),
            ));
        }
    }

    if !sent {
        writer_task
            .await
            .map_err(|e| Error::Transfer(format!("upload writer failed: {}", e)))?
            .map_err(send_failed)?;
    }
    Ok(())
}

impl Session {
    /// Upload `source` to `target` on the remote host.
    ///
    /// Consumes the session; it is closed whether or not the upload succeeds.
    pub async fn upload(self, source: impl AsRef<Path>, target: &str) -> Result<()> {
        let source = source.as_ref();
        tracing::debug!("uploading {} to {}:{}", source.display(), self.host(), target);

        let (mut channel, closer) = self.into_parts();
        let result = send_file(&mut channel, source, target).await;

        closer.close(&channel).await;
        result
    }
}

/// Connect and upload `source` to `target`.
pub async fn upload_file(
    params: &ConnectionParameters,
    source: impl AsRef<Path>,
    target: &str,
) -> Result<()> {
    Session::connect(params).await?.upload(source, target).await
}
