//! The wire adapter: a UNIX socket listener that authenticates peers by
//! their kernel-provided socket credentials, then bridges length-prefixed
//! frames to the session's inbound and outbound channels.

use anyhow::Context;
use async_std::channel::bounded;
use async_std::os::unix::net::{UnixListener, UnixStream};
use async_std::task;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hermeticum_world::protocol::{self, ClientFrame, Ping, Pong, ServerFrame, WorldEvent};
use hermeticum_world::{session, Game};
use slog::{error, info, o, warn};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const INBOUND_QUEUE_DEPTH: usize = 32;
const FRAME_QUEUE_DEPTH: usize = 64;

pub async fn serve(game: Arc<Game>, socket: PathBuf) -> anyhow::Result<()> {
    if socket.exists() {
        std::fs::remove_file(&socket)
            .with_context(|| format!("removing stale socket {}", socket.display()))?;
    }
    let listener = UnixListener::bind(&socket)
        .await
        .with_context(|| format!("binding {}", socket.display()))?;
    std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o777))
        .with_context(|| "opening the socket to all local users")?;
    info!(game.logger, "listening"; "socket" => %socket.display());

    {
        let game = game.clone();
        task::spawn(async move {
            loop {
                task::sleep(SWEEP_INTERVAL).await;
                game.supervisor.sweep().await;
            }
        });
    }

    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => {
                let game = game.clone();
                task::spawn(handle_connection(game, stream));
            }
            Err(err) => warn!(game.logger, "accept failed"; "err" => %err),
        }
    }
    Ok(())
}

async fn handle_connection(game: Arc<Game>, stream: UnixStream) {
    let logger = game.logger.new(o!("module" => "wire"));

    // credentials come off the socket before any payload is read
    let uid = match peer_uid(&stream) {
        Ok(uid) => uid,
        Err(err) => {
            error!(logger, "no peer credentials"; "err" => %err);
            return;
        }
    };
    let login = username_for(uid);
    info!(logger, "connected"; "uid" => uid, "login" => &login);

    let (cmd_tx, cmd_rx) = bounded(INBOUND_QUEUE_DEPTH);
    let (frame_tx, frame_rx) = bounded(FRAME_QUEUE_DEPTH);

    let writer = {
        let mut stream = stream.clone();
        let logger = logger.clone();
        task::spawn(async move {
            while let Ok(frame) = frame_rx.recv().await {
                if let Err(err) = protocol::write_frame(&mut stream, &frame).await {
                    warn!(logger, "write failed"; "err" => %err);
                    break;
                }
            }
        })
    };

    let reader = {
        let mut stream = stream.clone();
        let frame_tx = frame_tx.clone();
        let logger = logger.clone();
        task::spawn(async move {
            loop {
                match protocol::read_frame::<_, ClientFrame>(&mut stream).await {
                    Ok(Some(ClientFrame::Command(cmd))) => {
                        if cmd_tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(ClientFrame::Ping(ping))) => {
                        if frame_tx.send(ServerFrame::Pong(pong_for(ping))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(logger, "read failed"; "err" => %err);
                        break;
                    }
                }
            }
            // dropping cmd_tx lets the session loop observe the close
        })
    };

    if let Err(err) = session::run(game.clone(), uid, login, cmd_rx, frame_tx.clone()).await {
        warn!(logger, "session refused"; "uid" => uid, "err" => %err);
        let _ = frame_tx
            .send(ServerFrame::Event(WorldEvent::whisper(err.to_string())))
            .await;
    }
    drop(frame_tx);

    // unblock the reader so both halves wind down
    let _ = stream.shutdown(std::net::Shutdown::Both);
    reader.await;
    writer.await;
    info!(logger, "disconnected"; "uid" => uid);
}

fn pong_for(ping: Ping) -> Pong {
    let now = Utc::now();
    let delta = ping
        .when
        .parse::<DateTime<Utc>>()
        .map(|sent| format!("{}ms", (now - sent).num_milliseconds()))
        .unwrap_or_else(|_| "unknown".to_owned());
    Pong {
        when: now.to_rfc3339(),
        delta,
    }
}

fn peer_uid(stream: &UnixStream) -> std::io::Result<u32> {
    let fd = stream.as_raw_fd();
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(cred.uid)
}

/// Resolves a login name for the peer; uids without a passwd entry get a
/// synthetic one.
fn username_for(uid: u32) -> String {
    let mut buf = vec![0u8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc == 0 && !result.is_null() {
        let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
        if let Ok(name) = name.to_str() {
            return name.to_owned();
        }
    }
    format!("user-{}", uid)
}
