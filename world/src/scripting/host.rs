//! One dedicated worker per object.
//!
//! Embedded interpreters are not safe for concurrent use, so an engine is
//! only ever touched by the worker that owns it. Everyone else talks to
//! the worker through its bounded command queue; when the queue fills,
//! senders block, which is the backpressure signal the verb router wants.

use super::{Intents, ScriptEngine, VerbContext};
use crate::db::Store;
use crate::model::ObjectId;
use crate::protocol::WorldEvent;
use crate::session::SessionRegistry;
use crate::HOST_QUEUE_DEPTH;
use async_std::channel::{bounded, Receiver, Sender};
use async_std::task;
use slog::{debug, o, warn, Logger};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Fresh,
    Parsed,
    Serving,
    Reparsing,
    Dead,
}

/// What a worker needs besides its queue: somewhere to deliver events and
/// a store to apply `goes` movement against.
#[derive(Clone)]
pub struct HostCtx {
    pub store: Store,
    pub sessions: Arc<SessionRegistry>,
    pub logger: Logger,
}

/// Starts the worker for `object` and hands back its command queue.
/// Dropping the last sender closes the queue; the worker drains whatever
/// is buffered and stops.
pub fn spawn_host(object: ObjectId, ctx: HostCtx) -> Sender<VerbContext> {
    let (tx, rx) = bounded(HOST_QUEUE_DEPTH);
    task::spawn(run(object, rx, ctx));
    tx
}

async fn run(object: ObjectId, queue: Receiver<VerbContext>, ctx: HostCtx) {
    let logger = ctx.logger.new(o!("host" => object.0));
    let mut state = HostState::Fresh;
    let mut engine: Option<ScriptEngine> = None;

    while let Ok(vc) = queue.recv().await {
        let stale = engine
            .as_ref()
            .map(|e| e.fingerprint != vc.target.fingerprint)
            .unwrap_or(true);

        if stale {
            if engine.is_some() {
                state = HostState::Reparsing;
            }
            match ScriptEngine::load(&vc.target, &logger) {
                Ok(fresh) => {
                    if state == HostState::Fresh {
                        state = HostState::Parsed;
                        debug!(logger, "initial script load"; "state" => ?state);
                    }
                    engine = Some(fresh);
                    state = HostState::Serving;
                }
                Err(err) => {
                    // parse failure keeps the previous engine running
                    warn!(logger, "script rejected"; "err" => %err);
                    if engine.is_some() {
                        state = HostState::Serving;
                    } else {
                        state = HostState::Fresh;
                        continue;
                    }
                }
            }
        }

        let intents = match engine.as_ref() {
            Some(engine) => engine.dispatch(&vc),
            None => continue,
        };
        apply(&ctx, &logger, intents).await;
    }

    state = HostState::Dead;
    debug!(logger, "host stopped"; "state" => ?state);
}

async fn apply(ctx: &HostCtx, logger: &Logger, intents: Intents) {
    for delivery in intents.deliveries {
        // silently dropped unless the target is an avatar with a session
        ctx.sessions.deliver(delivery.to, delivery.event);
    }

    for mv in intents.moves {
        let room = match ctx.store.get_object(mv.into).await {
            Ok(room) => room,
            Err(err) => {
                warn!(logger, "goes() points at a missing room";
                      "room" => mv.into.0, "err" => %err);
                continue;
            }
        };
        match ctx.store.move_into(mv.object, mv.into).await {
            Ok(()) => {
                ctx.sessions.deliver(
                    mv.object,
                    WorldEvent::overheard(None, format!("you are now in {}", room.name())),
                );
            }
            Err(err) => {
                warn!(logger, "goes() move failed"; "err" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Object;
    use crate::scripting::Speaker;
    use crate::session::SessionHandle;
    use chrono::Utc;
    use slog::Discard;
    use std::time::Duration;

    fn test_logger() -> Logger {
        Logger::root(Discard, o!())
    }

    async fn test_ctx() -> (HostCtx, Store) {
        let logger = test_logger();
        let store = Store::in_memory(&logger).await.unwrap();
        store.migrate().await.unwrap();
        (
            HostCtx {
                store: store.clone(),
                sessions: Arc::new(SessionRegistry::new()),
                logger,
            },
            store,
        )
    }

    fn verb_for(target: &Object, sender: &Object, verb: &str, rest: &str) -> VerbContext {
        VerbContext {
            verb: verb.to_owned(),
            rest: rest.to_owned(),
            sender: Speaker::of(sender),
            target: target.clone(),
        }
    }

    async fn next_event(rx: &Receiver<WorldEvent>) -> WorldEvent {
        async_std::future::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[async_std::test]
    async fn commands_are_handled_in_enqueue_order() {
        let (ctx, store) = test_ctx().await;

        let mut listener = Object::new("listener", "").with_script(
            "hears(\".*\", |msg| tellMe(msg));",
        );
        listener.avatar = true;
        store.save(&mut listener).await.unwrap();

        let (tx, rx) = bounded(8);
        ctx.sessions
            .register(SessionHandle {
                uid: 1000,
                avatar_id: listener.id,
                outbound: tx,
                started_at: Utc::now(),
            })
            .unwrap();

        let queue = spawn_host(listener.id, ctx.clone());
        for text in ["one", "two", "three"].iter() {
            queue
                .send(verb_for(&listener, &listener, "say", text))
                .await
                .unwrap();
        }

        for expected in ["one", "two", "three"].iter() {
            let ev = next_event(&rx).await;
            assert_eq!(ev.text.as_deref(), Some(*expected));
        }
    }

    #[async_std::test]
    async fn fingerprint_change_triggers_a_reparse() {
        let (ctx, store) = test_ctx().await;

        let mut obj = Object::new("chameleon", "")
            .with_script("hears(\".*\", |_| tellMe(\"old\"));");
        obj.avatar = true;
        store.save(&mut obj).await.unwrap();

        let (tx, rx) = bounded(8);
        ctx.sessions
            .register(SessionHandle {
                uid: 1000,
                avatar_id: obj.id,
                outbound: tx,
                started_at: Utc::now(),
            })
            .unwrap();

        let queue = spawn_host(obj.id, ctx.clone());
        queue.send(verb_for(&obj, &obj, "say", "hi")).await.unwrap();
        assert_eq!(next_event(&rx).await.text.as_deref(), Some("old"));

        obj.script = "hears(\".*\", |_| tellMe(\"new\"));".to_owned();
        store.save(&mut obj).await.unwrap();

        queue.send(verb_for(&obj, &obj, "say", "hi")).await.unwrap();
        assert_eq!(next_event(&rx).await.text.as_deref(), Some("new"));
    }

    #[async_std::test]
    async fn broken_rewrite_keeps_the_prior_engine() {
        let (ctx, store) = test_ctx().await;

        let mut obj = Object::new("stoic", "")
            .with_script("hears(\".*\", |_| tellMe(\"steady\"));");
        obj.avatar = true;
        store.save(&mut obj).await.unwrap();

        let (tx, rx) = bounded(8);
        ctx.sessions
            .register(SessionHandle {
                uid: 1000,
                avatar_id: obj.id,
                outbound: tx,
                started_at: Utc::now(),
            })
            .unwrap();

        let queue = spawn_host(obj.id, ctx.clone());
        queue.send(verb_for(&obj, &obj, "say", "hi")).await.unwrap();
        assert_eq!(next_event(&rx).await.text.as_deref(), Some("steady"));

        obj.script = "hears(\".*\", |_| tellMe(".to_owned();
        store.save(&mut obj).await.unwrap();

        queue.send(verb_for(&obj, &obj, "say", "hi")).await.unwrap();
        assert_eq!(next_event(&rx).await.text.as_deref(), Some("steady"));
    }

    #[async_std::test]
    async fn goes_movement_is_applied_and_announced() {
        let (ctx, store) = test_ctx().await;

        let mut here = Object::new("yard", "");
        let mut there = Object::new("meadow", "a sunny meadow");
        store.save(&mut here).await.unwrap();
        store.save(&mut there).await.unwrap();

        let mut walker = Object::new("walker", "");
        walker.avatar = true;
        store.save(&mut walker).await.unwrap();
        store.move_into(walker.id, here.id).await.unwrap();

        let mut gate = Object::new("gate", "");
        gate.script = format!("goes(\"north\", {});", there.id.0);
        store.save(&mut gate).await.unwrap();
        store.move_into(gate.id, here.id).await.unwrap();

        let (tx, rx) = bounded(8);
        ctx.sessions
            .register(SessionHandle {
                uid: 1000,
                avatar_id: walker.id,
                outbound: tx,
                started_at: Utc::now(),
            })
            .unwrap();

        let queue = spawn_host(gate.id, ctx.clone());
        queue
            .send(verb_for(&gate, &walker, "go", "north"))
            .await
            .unwrap();

        let ev = next_event(&rx).await;
        assert_eq!(ev.text.as_deref(), Some("you are now in meadow"));
        assert_eq!(store.container_of(walker.id).await.unwrap().id, there.id);
    }
}
