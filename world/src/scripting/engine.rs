//! One object's embedded interpreter, its script-facing API and its
//! handler table.
//!
//! Handler callbacks are held and invoked as `rhai::FnPtr` handles; no
//! script source is ever synthesised at dispatch time, so a hostile
//! pattern cannot smuggle code into the dispatcher.

use super::{Delivery, Intents, MoveIntent, VerbContext};
use crate::direction::Direction;
use crate::model::{Object, ObjectId, Perm, Permissions};
use crate::protocol::WorldEvent;
use crate::{Error, Result};
use regex::Regex;
use rhai::{Dynamic, Engine, FnPtr, Map, AST};
use slog::{o, warn, Logger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Keeps a runaway script from wedging its host worker forever.
const MAX_SCRIPT_OPS: u64 = 100_000;

#[derive(Clone)]
enum Action {
    Callback(FnPtr),
    Traverse { dir: Direction, room: ObjectId },
}

#[derive(Clone)]
struct Handler {
    pattern: Regex,
    action: Action,
}

#[derive(Default)]
struct Shared {
    data: HashMap<String, String>,
    allows: Option<Permissions>,
    handlers: HashMap<String, Vec<Handler>>,
    current: Option<CurrentVerb>,
    intents: Intents,
}

#[derive(Clone)]
struct CurrentVerb {
    sender_id: ObjectId,
    sender_name: String,
    msg: String,
}

pub struct ScriptEngine {
    engine: Engine,
    ast: AST,
    shared: Arc<Mutex<Shared>>,
    object_id: ObjectId,
    owner_uid: u32,
    base_perms: Permissions,
    pub fingerprint: u64,
    logger: Logger,
}

impl ScriptEngine {
    /// Parses `obj.script` and runs its top level, which registers the
    /// object's handlers. Fails with `ParseFailure` on either step;
    /// callers keep any previously working engine in that case.
    pub fn load(obj: &Object, logger: &Logger) -> Result<ScriptEngine> {
        let logger = logger.new(o!("object" => obj.id.0));
        let shared = Arc::new(Mutex::new(Shared {
            data: obj.data.clone(),
            ..Default::default()
        }));

        let mut engine = Engine::new();
        engine.set_max_operations(MAX_SCRIPT_OPS);
        engine.set_max_expr_depths(64, 64);

        let object_id = obj.id;
        let object_name = obj.name().to_owned();
        let base_perms = obj.permissions;

        {
            let shared = shared.clone();
            engine.register_fn("has", move |table: Map| {
                let mut s = lock(&shared);
                for (k, v) in table {
                    s.data.insert(k.to_string(), dynamic_to_string(v));
                }
            });
        }

        {
            let shared = shared.clone();
            engine.register_fn("allows", move |table: Map| {
                let mut perms = base_perms;
                for (k, v) in table {
                    let value = match Perm::parse(&dynamic_to_string(v)) {
                        Some(p) => p,
                        None => continue,
                    };
                    match k.as_str() {
                        "read" => perms.read = value,
                        "write" => perms.write = value,
                        "carry" => perms.carry = value,
                        "execute" => perms.execute = value,
                        _ => {}
                    }
                }
                lock(&shared).allows = Some(perms);
            });
        }

        {
            let shared = shared.clone();
            let logger = logger.clone();
            engine.register_fn("hears", move |pattern: &str, cb: FnPtr| {
                add_handler(&shared, &logger, "say", pattern, Action::Callback(cb));
            });
        }

        {
            let shared = shared.clone();
            let logger = logger.clone();
            engine.register_fn("sees", move |pattern: &str, cb: FnPtr| {
                add_handler(&shared, &logger, "emote", pattern, Action::Callback(cb));
            });
        }

        {
            let shared = shared.clone();
            let logger = logger.clone();
            engine.register_fn("seen", move |cb: FnPtr| {
                add_handler(&shared, &logger, "look", ".*", Action::Callback(cb));
            });
        }

        {
            let shared = shared.clone();
            let logger = logger.clone();
            engine.register_fn("provides", move |spec: &str, cb: FnPtr| {
                let (verb, pattern) = match spec.split_once(' ') {
                    Some((verb, pattern)) => (verb.trim(), pattern.trim()),
                    None => (spec.trim(), ".*"),
                };
                add_handler(&shared, &logger, verb, pattern, Action::Callback(cb));
            });
        }

        {
            let shared = shared.clone();
            let logger = logger.clone();
            engine.register_fn("goes", move |dir: &str, room: i64| {
                match Direction::normalize(dir) {
                    Ok(dir) => add_handler(
                        &shared,
                        &logger,
                        "go",
                        ".*",
                        Action::Traverse {
                            dir,
                            room: ObjectId(room),
                        },
                    ),
                    Err(err) => warn!(logger, "goes() ignored"; "err" => %err),
                }
            });
        }

        {
            let shared = shared.clone();
            engine.register_fn("my", move |key: &str| -> Dynamic {
                match lock(&shared).data.get(key) {
                    Some(v) => Dynamic::from(v.clone()),
                    None => Dynamic::UNIT,
                }
            });
        }

        {
            let shared = shared.clone();
            engine.register_fn("tellMe", move |text: &str| {
                let mut s = lock(&shared);
                if let Some(cur) = s.current.clone() {
                    s.intents.deliveries.push(Delivery {
                        to: object_id,
                        event: WorldEvent::overheard(Some(cur.sender_name), text),
                    });
                }
            });
        }

        {
            let shared = shared.clone();
            let object_name = object_name.clone();
            engine.register_fn("tellSender", move |text: &str| {
                let mut s = lock(&shared);
                let source = s
                    .data
                    .get("name")
                    .cloned()
                    .unwrap_or_else(|| object_name.clone());
                if let Some(cur) = s.current.clone() {
                    s.intents.deliveries.push(Delivery {
                        to: cur.sender_id,
                        event: WorldEvent::overheard(Some(source), text),
                    });
                }
            });
        }

        {
            let shared = shared.clone();
            engine.register_fn("showMe", move |text: &str| {
                let mut s = lock(&shared);
                if let Some(cur) = s.current.clone() {
                    s.intents.deliveries.push(Delivery {
                        to: object_id,
                        event: WorldEvent::emote(cur.sender_name, text),
                    });
                }
            });
        }

        {
            let shared = shared.clone();
            engine.register_fn("sender", move || -> Map {
                let s = lock(&shared);
                let mut m = Map::new();
                if let Some(cur) = &s.current {
                    m.insert("id".into(), Dynamic::from(cur.sender_id.0));
                    m.insert("name".into(), cur.sender_name.clone().into());
                }
                m
            });
        }

        {
            let shared = shared.clone();
            engine.register_fn("msg", move || -> String {
                lock(&shared)
                    .current
                    .as_ref()
                    .map(|c| c.msg.clone())
                    .unwrap_or_default()
            });
        }

        let ast = engine
            .compile(&obj.script)
            .map_err(|err| Error::ParseFailure(err.to_string()))?;
        engine
            .run_ast(&ast)
            .map_err(|err| Error::ParseFailure(err.to_string()))?;

        Ok(ScriptEngine {
            engine,
            ast,
            shared,
            object_id,
            owner_uid: obj.owner_uid,
            base_perms,
            fingerprint: obj.fingerprint,
            logger,
        })
    }

    /// The permission table the execute gate consults: the script's
    /// `allows()` override when present, the stored permissions otherwise.
    pub fn execute_perm(&self) -> Perm {
        lock(&self.shared)
            .allows
            .map(|p| p.execute)
            .unwrap_or(self.base_perms.execute)
    }

    /// Runs every handler registered under `vc.verb` whose pattern
    /// matches `vc.rest`, in insertion order. A failing callback is
    /// logged and does not stop the ones after it.
    pub fn dispatch(&self, vc: &VerbContext) -> Intents {
        if self.execute_perm() == Perm::Owner && vc.sender.uid != self.owner_uid {
            return Intents::default();
        }

        {
            let mut s = lock(&self.shared);
            s.current = Some(CurrentVerb {
                sender_id: vc.sender.id,
                sender_name: vc.sender.name.clone(),
                msg: vc.rest.clone(),
            });
            s.intents = Intents::default();
        }

        // snapshot so callbacks may register new handlers mid-dispatch
        let matched: Vec<Action> = {
            let s = lock(&self.shared);
            s.handlers
                .get(&vc.verb)
                .map(|handlers| {
                    handlers
                        .iter()
                        .filter(|h| h.pattern.is_match(&vc.rest))
                        .map(|h| h.action.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for action in matched {
            match action {
                Action::Callback(cb) => {
                    if let Err(err) =
                        cb.call::<Dynamic>(&self.engine, &self.ast, (vc.rest.clone(),))
                    {
                        warn!(self.logger, "handler callback failed";
                              "verb" => %vc.verb, "err" => %err);
                    }
                }
                Action::Traverse { dir, room } => {
                    if matches!(Direction::normalize(&vc.rest), Ok(d) if d == dir) {
                        lock(&self.shared).intents.moves.push(MoveIntent {
                            object: vc.sender.id,
                            into: room,
                        });
                    }
                }
            }
        }

        let mut s = lock(&self.shared);
        s.current = None;
        std::mem::take(&mut s.intents)
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    #[cfg(test)]
    fn data_value(&self, key: &str) -> Option<String> {
        lock(&self.shared).data.get(key).cloned()
    }
}

fn add_handler(
    shared: &Arc<Mutex<Shared>>,
    logger: &Logger,
    verb: &str,
    pattern: &str,
    action: Action,
) {
    match Regex::new(pattern) {
        Ok(re) => {
            lock(shared)
                .handlers
                .entry(verb.to_owned())
                .or_insert_with(Vec::new)
                .push(Handler {
                    pattern: re,
                    action,
                });
        }
        Err(err) => {
            warn!(logger, "ignoring handler with unparseable pattern";
                  "verb" => verb, "pattern" => pattern, "err" => %err);
        }
    }
}

fn lock(shared: &Arc<Mutex<Shared>>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().expect("script engine state poisoned")
}

fn dynamic_to_string(v: Dynamic) -> String {
    if v.is::<()>() {
        return String::new();
    }
    match v.clone().into_string() {
        Ok(s) => s,
        Err(_) => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;
    use crate::scripting::Speaker;
    use slog::Discard;

    fn test_logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn scripted(id: i64, uid: u32, script: &str) -> Object {
        let mut obj = Object::new("thing", "a thing");
        obj.id = ObjectId(id);
        obj.owner_uid = uid;
        obj.script = script.to_owned();
        obj.refresh_fingerprint();
        obj
    }

    fn verb(verb: &str, rest: &str, sender_id: i64, sender_uid: u32, target: &Object) -> VerbContext {
        VerbContext {
            verb: verb.to_owned(),
            rest: rest.to_owned(),
            sender: Speaker {
                id: ObjectId(sender_id),
                name: "alice".to_owned(),
                uid: sender_uid,
            },
            target: target.clone(),
        }
    }

    #[test]
    fn hears_echoes_to_the_listening_object() {
        let obj = scripted(7, 1000, "hears(\".*\", |msg| tellMe(msg));");
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let intents = engine.dispatch(&verb("say", "hello", 3, 1001, &obj));
        assert_eq!(intents.deliveries.len(), 1);
        let d = &intents.deliveries[0];
        assert_eq!(d.to, ObjectId(7));
        assert_eq!(d.event.kind, EventKind::Overheard);
        assert_eq!(d.event.source.as_deref(), Some("alice"));
        assert_eq!(d.event.text.as_deref(), Some("hello"));
    }

    #[test]
    fn sees_emits_an_emote() {
        let obj = scripted(7, 1000, "sees(\".*\", |msg| showMe(msg));");
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let intents = engine.dispatch(&verb("emote", "waves", 3, 1001, &obj));
        assert_eq!(intents.deliveries.len(), 1);
        assert_eq!(intents.deliveries[0].event.kind, EventKind::Emote);
        assert_eq!(intents.deliveries[0].event.source.as_deref(), Some("alice"));
    }

    #[test]
    fn tell_sender_addresses_the_originator() {
        let obj = scripted(7, 1000, "seen(|_| tellSender(my(\"description\")));");
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let intents = engine.dispatch(&verb("look", "", 3, 1001, &obj));
        assert_eq!(intents.deliveries.len(), 1);
        let d = &intents.deliveries[0];
        assert_eq!(d.to, ObjectId(3));
        assert_eq!(d.event.source.as_deref(), Some("thing"));
        assert_eq!(d.event.text.as_deref(), Some("a thing"));
    }

    #[test]
    fn provides_matches_its_pattern_only() {
        let obj = scripted(
            7,
            1000,
            "provides(\"knock .*\", |_| tellSender(\"who's there?\"));",
        );
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let hit = engine.dispatch(&verb("knock", "loudly", 3, 1001, &obj));
        assert_eq!(hit.deliveries.len(), 1);

        let miss = engine.dispatch(&verb("kick", "loudly", 3, 1001, &obj));
        assert!(miss.is_empty());
    }

    #[test]
    fn handlers_run_in_insertion_order_and_all_matches_fire() {
        let obj = scripted(
            7,
            1000,
            "hears(\".*\", |_| tellMe(\"first\"));\n\
             hears(\"hel.*\", |_| tellMe(\"second\"));",
        );
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let intents = engine.dispatch(&verb("say", "hello", 3, 1001, &obj));
        let texts: Vec<_> = intents
            .deliveries
            .iter()
            .filter_map(|d| d.event.text.clone())
            .collect();
        assert_eq!(texts, vec!["first".to_owned(), "second".to_owned()]);
    }

    #[test]
    fn a_failing_callback_does_not_stop_the_rest() {
        let obj = scripted(
            7,
            1000,
            "hears(\".*\", |_| { throw \"kaboom\"; });\n\
             hears(\".*\", |_| tellMe(\"survived\"));",
        );
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let intents = engine.dispatch(&verb("say", "hi", 3, 1001, &obj));
        assert_eq!(intents.deliveries.len(), 1);
        assert_eq!(intents.deliveries[0].event.text.as_deref(), Some("survived"));
    }

    #[test]
    fn goes_moves_the_sender_on_a_matching_direction() {
        let obj = scripted(7, 1000, "goes(\"north\", 42);");
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let intents = engine.dispatch(&verb("go", "north", 3, 1001, &obj));
        assert_eq!(
            intents.moves,
            vec![MoveIntent {
                object: ObjectId(3),
                into: ObjectId(42),
            }]
        );

        let miss = engine.dispatch(&verb("go", "south", 3, 1001, &obj));
        assert!(miss.moves.is_empty());
        let nonsense = engine.dispatch(&verb("go", "sideways", 3, 1001, &obj));
        assert!(nonsense.moves.is_empty());
    }

    #[test]
    fn execute_owner_gates_out_strangers() {
        let mut obj = scripted(7, 1000, "hears(\".*\", |msg| tellMe(msg));");
        obj.permissions.execute = Perm::Owner;
        obj.refresh_fingerprint();
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();

        let stranger = engine.dispatch(&verb("say", "hi", 3, 1001, &obj));
        assert!(stranger.is_empty());

        let owner = engine.dispatch(&verb("say", "hi", 3, 1000, &obj));
        assert_eq!(owner.deliveries.len(), 1);
    }

    #[test]
    fn allows_overrides_the_stored_execute_permission() {
        let obj = scripted(
            7,
            1000,
            "allows(#{ execute: \"owner\" });\nhears(\".*\", |msg| tellMe(msg));",
        );
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();
        assert_eq!(engine.execute_perm(), Perm::Owner);

        let stranger = engine.dispatch(&verb("say", "hi", 3, 1001, &obj));
        assert!(stranger.is_empty());
    }

    #[test]
    fn has_merges_into_the_data_view() {
        let obj = scripted(
            7,
            1000,
            "has(#{ mood: \"sunny\" });\nhears(\".*\", |_| tellMe(my(\"mood\")));",
        );
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();
        assert_eq!(engine.data_value("mood").as_deref(), Some("sunny"));
        // stored data is still visible
        assert_eq!(engine.data_value("name").as_deref(), Some("thing"));

        let intents = engine.dispatch(&verb("say", "hi", 3, 1001, &obj));
        assert_eq!(intents.deliveries[0].event.text.as_deref(), Some("sunny"));
    }

    #[test]
    fn parse_failure_is_reported() {
        let obj = scripted(7, 1000, "hears(\".*\", |msg| tellMe(msg)");
        assert!(matches!(
            ScriptEngine::load(&obj, &test_logger()),
            Err(Error::ParseFailure(_))
        ));
    }

    #[test]
    fn bad_handler_patterns_are_skipped() {
        let obj = scripted(
            7,
            1000,
            "hears(\"(\", |_| tellMe(\"never\"));\nhears(\".*\", |_| tellMe(\"ok\"));",
        );
        let engine = ScriptEngine::load(&obj, &test_logger()).unwrap();
        let intents = engine.dispatch(&verb("say", "(", 3, 1001, &obj));
        assert_eq!(intents.deliveries.len(), 1);
        assert_eq!(intents.deliveries[0].event.text.as_deref(), Some("ok"));
    }
}
