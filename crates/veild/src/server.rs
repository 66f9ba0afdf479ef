//! Control protocol server on a Unix stream socket.
//!
//! Each connection carries a sequence of length-framed requests. Callers are
//! identified by their socket credentials; uid 0 holds the administrative
//! capability in the initial user namespace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use zerocopy::FromBytes;
use zeroize::Zeroizing;

use veil_control::{Caller, Control, Reply, INIT_USER_NS};
use veil_core::wire::{
    done_message, error_message, MsgHeader, MAX_REQUEST_LEN, MSG_HEADER_LEN, PAYLOAD_OFFSET,
};

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    control: Arc<Control>,
    shutdown: broadcast::Receiver<()>,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket file.
    pub fn bind(path: &Path, control: Arc<Control>, shutdown: broadcast::Receiver<()>) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        tracing::info!(path = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            control,
            shutdown,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("control server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let control = self.control.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, control).await {
                            tracing::debug!(error = %e, "control connection closed");
                        }
                    });
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove control socket");
        }
        Ok(())
    }
}

async fn serve_connection(mut stream: UnixStream, control: Arc<Control>) -> Result<()> {
    let caller = caller_for(&stream, &control)?;
    tracing::debug!(pid = caller.pid, "control connection");

    let mut head = [0u8; MSG_HEADER_LEN];
    loop {
        match stream.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e).context("read request header"),
        }
        let header = MsgHeader::read_from(&head[..]).context("request header")?;
        let len = header.len as usize;
        if !(PAYLOAD_OFFSET..=MAX_REQUEST_LEN).contains(&len) {
            stream.write_all(&error_message(&header, libc::EINVAL)).await?;
            anyhow::bail!("bad request length {len}");
        }

        // Wiped on drop, including when the body read fails partway.
        let mut request = Zeroizing::new(vec![0u8; len]);
        request[..MSG_HEADER_LEN].copy_from_slice(&head);
        stream
            .read_exact(&mut request[MSG_HEADER_LEN..])
            .await
            .context("read request body")?;

        match control.handle(&caller, &mut request) {
            Reply::Message(reply) => stream.write_all(&reply).await?,
            Reply::Dump(mut session) => loop {
                match session.next_message() {
                    Ok(Some(msg)) => stream.write_all(&msg).await?,
                    Ok(None) => {
                        stream.write_all(&done_message(header.seq)).await?;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(pid = caller.pid, error = %e, "dump failed");
                        stream.write_all(&error_message(&header, e.errno())).await?;
                        break;
                    }
                }
            },
        }
    }
}

/// Build the caller identity from the peer's socket credentials.
fn caller_for(stream: &UnixStream, control: &Control) -> Result<Caller> {
    let cred = stream.peer_cred().context("SO_PEERCRED")?;
    let pid = cred.pid().and_then(|p| u32::try_from(p).ok()).unwrap_or(0);
    let namespaces = control.namespaces();
    let netns = namespaces.by_pid(pid).unwrap_or_else(|| namespaces.init());
    let caller = Caller::new(pid, netns);
    Ok(if cred.uid() == 0 {
        caller.with_capability(INIT_USER_NS)
    } else {
        caller
    })
}
