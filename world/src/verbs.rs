//! The verb router.
//!
//! Built-in verbs are answered directly with server-synthesised `PRINT`
//! events; everything else fans out to every object within earshot of
//! the speaking avatar. Store failures whisper "server error :(" to the
//! originator and abort the verb without taking the session down.

use crate::direction::Direction;
use crate::game::Game;
use crate::model::{Object, Perm};
use crate::protocol::{Command, WorldEvent};
use crate::scripting::{Speaker, VerbContext};
use crate::{Error, Result};
use slog::{debug, error};
use std::sync::Arc;

/// Entry point for one inbound command. Never fails: errors are reported
/// to the originating session as a WHISPER.
pub async fn dispatch(game: Arc<Game>, uid: u32, cmd: Command) {
    debug!(game.logger, "verb"; "uid" => uid, "verb" => %cmd.verb, "rest" => %cmd.rest);
    if let Err(err) = route(&game, uid, &cmd).await {
        error!(game.logger, "verb failed"; "uid" => uid, "verb" => %cmd.verb, "err" => %err);
        if let Ok(avatar) = game.store.avatar_for_uid(uid).await {
            game.sessions
                .deliver(avatar.id, WorldEvent::whisper("server error :("));
        }
    }
}

async fn route(game: &Arc<Game>, uid: u32, cmd: &Command) -> Result<()> {
    let avatar = game.store.avatar_for_uid(uid).await?;
    let verb = if cmd.verb.is_empty() { "say" } else { cmd.verb.as_str() };

    match verb {
        "look" => {
            look(game, &avatar).await?;
            fan_out(game, &avatar, "look", &cmd.rest).await
        }
        "inv" => inv(game, &avatar).await,
        "get" => get(game, &avatar, &cmd.rest).await,
        "drop" => drop_held(game, &avatar, &cmd.rest).await,
        "dig" => dig(game, &avatar, &cmd.rest).await,
        "create" => create(game, &avatar).await,
        _ => fan_out(game, &avatar, verb, &cmd.rest).await,
    }
}

/// Sends a verb to every object in earshot of `avatar`, one enqueue per
/// target, no join; handlers produce their events asynchronously.
async fn fan_out(game: &Arc<Game>, avatar: &Object, verb: &str, rest: &str) -> Result<()> {
    let heard = game.store.earshot(avatar).await?;
    let sender = Speaker::of(avatar);
    for target in heard {
        game.supervisor
            .submit(VerbContext {
                verb: verb.to_owned(),
                rest: rest.to_owned(),
                sender: sender.clone(),
                target,
            })
            .await;
    }
    Ok(())
}

fn print(game: &Game, avatar: &Object, text: impl Into<String>) {
    game.sessions.deliver(avatar.id, WorldEvent::print(text));
}

/// The built-in room description; scripts may add to it via `seen()`
/// handlers, but this PRINT is the authoritative source.
async fn look(game: &Arc<Game>, avatar: &Object) -> Result<()> {
    let room = match game.store.container_of(avatar.id).await {
        Ok(room) => room,
        Err(Error::NotFound(_)) => {
            print(game, avatar, "you drift in a featureless void.");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let contents = game.store.contents(room.id).await?;
    let mut text = format!("{}\n{}", room.name(), room.description());
    let visible: Vec<&str> = contents
        .iter()
        .filter(|o| o.id != avatar.id)
        .map(|o| o.name())
        .collect();
    if !visible.is_empty() {
        text.push_str("\nyou see: ");
        text.push_str(&visible.join(", "));
    }
    print(game, avatar, text);
    Ok(())
}

async fn inv(game: &Arc<Game>, avatar: &Object) -> Result<()> {
    let held = game.store.contents(avatar.id).await?;
    if held.is_empty() {
        print(game, avatar, "you aren't carrying anything.");
        return Ok(());
    }

    let names: Vec<&str> = held.iter().map(|o| o.name()).collect();
    print(game, avatar, format!("you are carrying: {}", names.join(", ")));

    // held objects get a chance to react to being looked at
    let sender = Speaker::of(avatar);
    for target in held {
        game.supervisor
            .submit(VerbContext {
                verb: "look".to_owned(),
                rest: String::new(),
                sender: sender.clone(),
                target,
            })
            .await;
    }
    Ok(())
}

async fn get(game: &Arc<Game>, avatar: &Object, rest: &str) -> Result<()> {
    let term = rest.trim();
    if term.is_empty() {
        print(game, avatar, "get what?");
        return Ok(());
    }

    let room_id = game
        .store
        .container_of(avatar.id)
        .await
        .ok()
        .map(|room| room.id);
    let candidates: Vec<Object> = game
        .store
        .resolve(avatar, term)
        .await?
        .into_iter()
        .filter(|o| o.id != avatar.id && Some(o.id) != room_id)
        .collect();

    let target = match candidates.as_slice() {
        [] => {
            print(game, avatar, "you don't see that here.");
            return Ok(());
        }
        [target] => target,
        _ => {
            print(game, avatar, "be more specific.");
            return Ok(());
        }
    };

    if target.permissions.carry == Perm::Owner && target.owner_uid != avatar.owner_uid {
        print(game, avatar, format!("you can't take the {}.", target.name()));
        return Ok(());
    }

    game.store.move_into(target.id, avatar.id).await?;
    print(game, avatar, format!("you get the {}.", target.name()));
    Ok(())
}

async fn drop_held(game: &Arc<Game>, avatar: &Object, rest: &str) -> Result<()> {
    let term = rest.trim();
    let held = game.store.contents(avatar.id).await?;
    let by_id: Option<i64> = term.parse().ok();
    let candidates: Vec<&Object> = held
        .iter()
        .filter(|o| o.name().contains(term) || Some(o.id.0) == by_id)
        .collect();

    let target = match candidates.as_slice() {
        [] => {
            print(game, avatar, "you aren't holding that.");
            return Ok(());
        }
        [target] => *target,
        _ => {
            print(game, avatar, "be more specific.");
            return Ok(());
        }
    };

    let room = match game.store.container_of(avatar.id).await {
        Ok(room) => room,
        Err(Error::NotFound(_)) => {
            print(game, avatar, "there's nowhere to drop that.");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    game.store.move_into(target.id, room.id).await?;
    print(game, avatar, format!("you drop the {}.", target.name()));
    Ok(())
}

/// Creates a new room in the given direction plus a door on each side;
/// the doors' scripts carry the `goes` registrations that let avatars
/// walk (or climb) through.
async fn dig(game: &Arc<Game>, avatar: &Object, rest: &str) -> Result<()> {
    let dir = match Direction::normalize(rest) {
        Ok(dir) => dir,
        Err(_) => {
            print(
                game,
                avatar,
                "valid headings are: north, south, east, west, above, below",
            );
            return Ok(());
        }
    };

    let here = match game.store.container_of(avatar.id).await {
        Ok(room) => room,
        Err(Error::NotFound(_)) => {
            print(game, avatar, "you can't dig here.");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let mut site = Object::new(
        "construction site",
        "bare studs and the smell of fresh sawdust.",
    );
    site.owner_uid = avatar.owner_uid;
    game.store.save(&mut site).await?;

    let door_name = if dir.is_vertical() { "ladder" } else { "small gate" };

    let mut near_door = Object::new(
        door_name,
        &format!("a {} leading {}.", door_name, dir.human()),
    )
    .with_script(&format!("goes(\"{}\", {});\n", dir.human(), site.id.0));
    near_door.owner_uid = avatar.owner_uid;
    game.store.save(&mut near_door).await?;
    game.store.move_into(near_door.id, here.id).await?;

    let reverse = dir.reverse();
    let mut far_door = Object::new(
        door_name,
        &format!("a {} leading {}.", door_name, reverse.human()),
    )
    .with_script(&format!("goes(\"{}\", {});\n", reverse.human(), here.id.0));
    far_door.owner_uid = avatar.owner_uid;
    game.store.save(&mut far_door).await?;
    game.store.move_into(far_door.id, site.id).await?;

    print(
        game,
        avatar,
        format!("you dig {}. a {} appears.", dir.human(), door_name),
    );
    Ok(())
}

async fn create(game: &Arc<Game>, avatar: &Object) -> Result<()> {
    let mut obj = Object::new("smooth stone", "a palm-sized stone, cool to the touch.");
    obj.owner_uid = avatar.owner_uid;
    game.store.save(&mut obj).await?;
    game.store.move_into(obj.id, avatar.id).await?;
    print(game, avatar, "you now have a smooth stone.");
    Ok(())
}
