//! Session lifecycle: one per authenticated local user.
//!
//! The wire adapter hands us a channel of inbound commands and a channel
//! for outbound frames; everything between those two (avatar rez, command
//! fan-in, event fan-out, teardown) lives here.

use crate::game::Game;
use crate::model::ObjectId;
use crate::protocol::{Command, ServerFrame, WorldEvent};
use crate::verbs;
use crate::{Error, Result};
use async_std::channel::{bounded, Receiver, Sender};
use async_std::task;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use slog::{info, o, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Events queued towards one client before its wire writer backpressures.
const EVENT_QUEUE_DEPTH: usize = 64;

/// The registry's view of one live session.
pub struct SessionHandle {
    pub uid: u32,
    pub avatar_id: ObjectId,
    pub outbound: Sender<WorldEvent>,
    pub started_at: DateTime<Utc>,
}

/// Process-wide table of live sessions, at most one per uid.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u32, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    pub fn register(&self, handle: SessionHandle) -> Result<()> {
        let mut sessions = self.lock();
        if sessions.contains_key(&handle.uid) {
            return Err(Error::AlreadyConnected(handle.uid));
        }
        sessions.insert(handle.uid, handle);
        Ok(())
    }

    pub fn unregister(&self, uid: u32) -> Option<SessionHandle> {
        self.lock().remove(&uid)
    }

    pub fn is_connected(&self, uid: u32) -> bool {
        self.lock().contains_key(&uid)
    }

    /// Queues `event` for the session whose avatar is `to`. Returns
    /// false, without complaint, when no such session exists or its
    /// queue is full.
    pub fn deliver(&self, to: ObjectId, event: WorldEvent) -> bool {
        let sessions = self.lock();
        match sessions.values().find(|h| h.avatar_id == to) {
            Some(handle) => handle.outbound.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Avatar ids of every live session; the supervisor's sweep pins
    /// these and their rooms.
    pub fn avatar_ids(&self) -> Vec<ObjectId> {
        self.lock().values().map(|h| h.avatar_id).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, SessionHandle>> {
        self.sessions.lock().expect("session table poisoned")
    }
}

/// Runs one session to completion: rezzes the avatar into the foyer,
/// multiplexes commands and events, and tears everything down when the
/// stream closes, the user quits, or the wire errors out.
pub async fn run(
    game: Arc<Game>,
    uid: u32,
    login: String,
    inbound: Receiver<Command>,
    wire_tx: Sender<ServerFrame>,
) -> Result<()> {
    let logger = game.logger.new(o!("session" => uid));

    let avatar = game.store.ensure_avatar(uid, &login).await?;

    let (event_tx, event_rx) = bounded(EVENT_QUEUE_DEPTH);
    game.sessions.register(SessionHandle {
        uid,
        avatar_id: avatar.id,
        outbound: event_tx,
        started_at: Utc::now(),
    })?;

    info!(logger, "session started"; "avatar" => avatar.id.0, "login" => &login);

    // once the uid is registered, every exit path must run teardown
    let result = drive(&game, uid, avatar.id, inbound, event_rx, wire_tx).await;
    teardown(&game, uid).await;
    info!(logger, "session ended");
    result
}

/// Rezzes the avatar and multiplexes the session's channels until one of
/// them signals the end.
async fn drive(
    game: &Arc<Game>,
    uid: u32,
    avatar_id: ObjectId,
    inbound: Receiver<Command>,
    event_rx: Receiver<WorldEvent>,
    wire_tx: Sender<ServerFrame>,
) -> Result<()> {
    let foyer = game.store.get_object_by_owner_name(0, "foyer").await?;
    game.store.move_into(avatar_id, foyer.id).await?;

    loop {
        let next_cmd = inbound.recv().fuse();
        let next_event = event_rx.recv().fuse();
        futures::pin_mut!(next_cmd, next_event);

        futures::select! {
            cmd = next_cmd => match cmd {
                Ok(cmd) => {
                    if cmd.verb == "quit" || cmd.verb == "q" {
                        return Ok(());
                    }
                    // a fresh task per command: slow scripts must not
                    // block the next command or the event fan-out
                    task::spawn(verbs::dispatch(game.clone(), uid, cmd));
                }
                Err(_) => return Ok(()), // wire reader closed the channel
            },
            event = next_event => match event {
                Ok(event) => {
                    if wire_tx.send(ServerFrame::Event(event)).await.is_err() {
                        return Ok(());
                    }
                }
                Err(_) => return Ok(()),
            },
        }
    }
}

/// Idempotent: the first caller wins, later calls find no session. The
/// session leaves the table before the farewell broadcast so the fading
/// avatar cannot hear itself.
pub async fn teardown(game: &Game, uid: u32) {
    let handle = match game.sessions.unregister(uid) {
        Some(handle) => handle,
        None => return,
    };
    let logger = game.logger.new(o!("session" => uid));

    match game.store.get_object(handle.avatar_id).await {
        Ok(avatar) => match game.store.earshot(&avatar).await {
            Ok(heard) => {
                for obj in heard {
                    if obj.avatar && obj.id != avatar.id {
                        game.sessions.deliver(
                            obj.id,
                            WorldEvent::emote(avatar.name(), "slowly fades out of existence"),
                        );
                    }
                }
            }
            Err(err) => warn!(logger, "no farewell broadcast"; "err" => %err),
        },
        Err(err) => warn!(logger, "avatar vanished before teardown"; "err" => %err),
    }

    if let Err(err) = game.store.derez(uid).await {
        warn!(logger, "derez failed"; "err" => %err);
    }
    // dropping the handle closes the event channel
}
