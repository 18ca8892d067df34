//! Cache of live script hosts, keyed by object id.
//!
//! Hosts are addressed only through their command queues; nothing here
//! ever touches an engine, so readers of the map can be concurrent. The
//! map holds the queue sender, not the host: dropping the entry closes
//! the queue and the worker drains then stops on its own.

use crate::db::Store;
use crate::model::ObjectId;
use crate::scripting::{spawn_host, HostCtx, VerbContext};
use crate::session::SessionRegistry;
use async_std::channel::Sender;
use slog::{debug, o, Logger};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

pub struct Supervisor {
    hosts: RwLock<HashMap<ObjectId, Sender<VerbContext>>>,
    ctx: HostCtx,
    logger: Logger,
}

impl Supervisor {
    pub fn new(store: Store, sessions: Arc<SessionRegistry>, logger: Logger) -> Supervisor {
        let logger = logger.new(o!("module" => "supervisor"));
        Supervisor {
            hosts: RwLock::new(HashMap::new()),
            ctx: HostCtx {
                store,
                sessions,
                logger: logger.clone(),
            },
            logger,
        }
    }

    /// Enqueues a verb for its target's host, creating the host on first
    /// contact. Blocks while the target's queue is saturated; that
    /// backpressure is what throttles a session spamming a slow script.
    pub async fn submit(&self, vc: VerbContext) {
        let id = vc.target.id;
        let queue = self.handle_for(id);
        if let Err(returned) = queue.send(vc).await {
            // the host was evicted between lookup and send; forget the
            // stale handle and run the verb on a fresh one
            self.write().remove(&id);
            let queue = self.handle_for(id);
            let _ = queue.send(returned.0).await;
        }
    }

    fn handle_for(&self, id: ObjectId) -> Sender<VerbContext> {
        if let Some(queue) = self.read().get(&id) {
            return queue.clone();
        }
        self.write()
            .entry(id)
            .or_insert_with(|| spawn_host(id, self.ctx.clone()))
            .clone()
    }

    /// Drops hosts in rooms no avatar is standing in. Live avatars and
    /// their rooms are pinned. Run periodically once the world grows.
    pub async fn sweep(&self) {
        let ids: Vec<ObjectId> = self.read().keys().copied().collect();
        if ids.is_empty() {
            return;
        }

        let avatars: HashSet<ObjectId> = self.ctx.sessions.avatar_ids().into_iter().collect();
        let mut occupied_rooms = HashSet::new();
        for avatar in avatars.iter() {
            if let Ok(room) = self.ctx.store.container_of(*avatar).await {
                occupied_rooms.insert(room.id);
            }
        }

        let mut evicted = 0usize;
        for id in ids {
            if avatars.contains(&id) || occupied_rooms.contains(&id) {
                continue;
            }
            // an uncontained object is a room and counts as its own room
            let room = match self.ctx.store.container_of(id).await {
                Ok(room) => room.id,
                Err(_) => id,
            };
            if occupied_rooms.contains(&room) {
                continue;
            }
            if self.write().remove(&id).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(self.logger, "swept idle hosts"; "evicted" => evicted);
        }
    }

    pub fn host_count(&self) -> usize {
        self.read().len()
    }

    pub fn has_host(&self, id: ObjectId) -> bool {
        self.read().contains_key(&id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ObjectId, Sender<VerbContext>>> {
        self.hosts.read().expect("supervisor map poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ObjectId, Sender<VerbContext>>> {
        self.hosts.write().expect("supervisor map poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Object;
    use crate::scripting::Speaker;
    use crate::session::SessionHandle;
    use async_std::channel::bounded;
    use chrono::Utc;
    use slog::Discard;
    use std::time::Duration;

    async fn test_world() -> (Supervisor, Store, Arc<SessionRegistry>) {
        let logger = Logger::root(Discard, o!());
        let store = Store::in_memory(&logger).await.unwrap();
        store.migrate().await.unwrap();
        let sessions = Arc::new(SessionRegistry::new());
        (
            Supervisor::new(store.clone(), sessions.clone(), logger),
            store,
            sessions,
        )
    }

    fn say(target: &Object, sender: &Object, text: &str) -> VerbContext {
        VerbContext {
            verb: "say".to_owned(),
            rest: text.to_owned(),
            sender: Speaker::of(sender),
            target: target.clone(),
        }
    }

    #[async_std::test]
    async fn at_most_one_host_per_object() {
        let (sup, store, _sessions) = test_world().await;
        let mut egg = Object::new("egg", "");
        store.save(&mut egg).await.unwrap();

        for _ in 0..5 {
            sup.submit(say(&egg, &egg, "hi")).await;
        }
        assert_eq!(sup.host_count(), 1);
        assert!(sup.has_host(egg.id));
    }

    #[async_std::test]
    async fn sweep_keeps_occupied_rooms_and_their_contents() {
        let (sup, store, sessions) = test_world().await;

        let mut lobby = Object::new("lobby", "");
        let mut cellar = Object::new("cellar", "");
        store.save(&mut lobby).await.unwrap();
        store.save(&mut cellar).await.unwrap();

        let mut lamp = Object::new("lamp", "");
        let mut crate_obj = Object::new("crate", "");
        store.save(&mut lamp).await.unwrap();
        store.save(&mut crate_obj).await.unwrap();
        store.move_into(lamp.id, lobby.id).await.unwrap();
        store.move_into(crate_obj.id, cellar.id).await.unwrap();

        let mut avatar = Object::new("alice", "");
        avatar.avatar = true;
        store.save(&mut avatar).await.unwrap();
        store.move_into(avatar.id, lobby.id).await.unwrap();

        let (tx, _rx) = bounded(8);
        sessions
            .register(SessionHandle {
                uid: 1000,
                avatar_id: avatar.id,
                outbound: tx,
                started_at: Utc::now(),
            })
            .unwrap();

        for obj in [&lobby, &cellar, &lamp, &crate_obj, &avatar].iter() {
            sup.submit(say(obj, &avatar, "hi")).await;
        }
        assert_eq!(sup.host_count(), 5);

        sup.sweep().await;

        assert!(sup.has_host(lobby.id), "occupied room stays");
        assert!(sup.has_host(lamp.id), "object in occupied room stays");
        assert!(sup.has_host(avatar.id), "live avatar stays");
        assert!(!sup.has_host(cellar.id), "empty room goes");
        assert!(!sup.has_host(crate_obj.id), "object in empty room goes");
    }

    #[async_std::test]
    async fn submit_after_eviction_respawns_the_host() {
        let (sup, store, sessions) = test_world().await;

        let mut room = Object::new("room", "");
        store.save(&mut room).await.unwrap();
        let mut echo = Object::new("echo", "").with_script("hears(\".*\", |msg| tellMe(msg));");
        echo.avatar = true;
        store.save(&mut echo).await.unwrap();
        store.move_into(echo.id, room.id).await.unwrap();

        sup.submit(say(&echo, &echo, "first")).await;
        sup.sweep().await; // no sessions: everything is evicted
        assert_eq!(sup.host_count(), 0);

        let (tx, rx) = bounded(8);
        sessions
            .register(SessionHandle {
                uid: 1000,
                avatar_id: echo.id,
                outbound: tx,
                started_at: Utc::now(),
            })
            .unwrap();

        sup.submit(say(&echo, &echo, "second")).await;
        let ev = async_std::future::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event")
            .expect("channel closed");
        assert_eq!(ev.text.as_deref(), Some("second"));
        assert_eq!(sup.host_count(), 1);
    }
}
