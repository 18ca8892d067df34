//! The world-object execution core of hermeticum: a multi-user text world
//! in which every entity is a live, scriptable object.
//!
//! Sessions feed verbs into the [`verbs`] router, which fans each verb out
//! to every object within earshot. Each object runs its script in an
//! isolated interpreter managed by the [`supervisor`]; events the scripts
//! emit flow back out through the [`session`] registry.

pub mod db;
pub mod direction;
pub mod game;
pub mod model;
pub mod protocol;
pub mod scripting;
pub mod session;
pub mod supervisor;
pub mod verbs;

use thiserror::Error;

pub use game::Game;
pub use model::{Object, ObjectId};

/// Depth of a script host's command queue. A saturated queue blocks the
/// verb router, which in turn throttles the offending session.
pub const HOST_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} was not found")]
    NotFound(String),

    #[error("a session for uid {0} is already connected")]
    AlreadyConnected(u32),

    #[error("did not understand direction '{0}'")]
    InvalidDirection(String),

    #[error("moving {moved} into {container} would create a cycle")]
    CycleDetected {
        moved: ObjectId,
        container: ObjectId,
    },

    #[error("script failed to parse: {0}")]
    ParseFailure(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Error::NotFound(what.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
