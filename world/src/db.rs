//! Durable storage for objects, containment edges and permissions.
//!
//! All mutation funnels through here; containment changes and avatar
//! creation are transactional. The schema lives in `schema.sql` and is
//! applied idempotently by [`Store::migrate`].

use crate::model::{Object, ObjectId, Perm, Permissions};
use crate::{Error, Result};
use rand::Rng;
use slog::{debug, o, warn, Logger};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::path::Path;

const SCHEMA: &str = include_str!("schema.sql");

const SMELLS: [&str; 5] = [
    "lavender",
    "petrichor",
    "juniper",
    "pine sap",
    "wood smoke",
];

/// Script given to every new avatar: echo what it hears and sees back to
/// its own session.
const AVATAR_SCRIPT: &str = "\
hears(\".*\", |msg| tellMe(msg));

sees(\".*\", |msg| showMe(msg));
";

const OBJECT_COLUMNS: &str = "\
o.id, o.avatar, o.bedroom, o.data, o.owneruid, o.script, \
p.read_perm, p.write_perm, p.carry_perm, p.exec_perm";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    logger: Logger,
}

impl Store {
    /// Opens (and creates, if missing) a file-backed world database.
    pub async fn connect(path: &Path, logger: &Logger) -> Result<Store> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Store {
            pool,
            logger: logger.new(o!("module" => "db")),
        })
    }

    /// An in-memory database, used by the test suite. A single pooled
    /// connection, because every SQLite `:memory:` connection is its own
    /// database.
    pub async fn in_memory(logger: &Logger) -> Result<Store> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new())
            .await?;
        Ok(Store {
            pool,
            logger: logger.new(o!("module" => "db")),
        })
    }

    /// Applies the embedded schema. Safe to call on every start.
    pub async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drops every table. The `reset` command runs this before
    /// re-migrating.
    pub async fn erase(&self) -> Result<()> {
        for stmt in [
            "DROP TABLE IF EXISTS contains",
            "DROP TABLE IF EXISTS permissions",
            "DROP TABLE IF EXISTS objects",
        ]
        .iter()
        {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Removes containment edges left behind by avatars that were still
    /// connected when the server last went down.
    pub async fn ghost_bust(&self) -> Result<()> {
        let res = sqlx::query(
            "DELETE FROM contains WHERE contained IN (SELECT id FROM objects WHERE avatar)",
        )
        .execute(&self.pool)
        .await?;
        debug!(self.logger, "busted {} ghosts", res.rows_affected());
        Ok(())
    }

    pub async fn get_object(&self, id: ObjectId) -> Result<Object> {
        let stmt = format!(
            "SELECT {} FROM objects o LEFT JOIN permissions p ON p.object = o.id WHERE o.id = ?",
            OBJECT_COLUMNS
        );
        sqlx::query(&stmt)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| object_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("object {}", id)))
    }

    /// Exact match on the `name` data field and owner uid.
    pub async fn get_object_by_owner_name(&self, uid: u32, name: &str) -> Result<Object> {
        let stmt = format!(
            "SELECT {} FROM objects o LEFT JOIN permissions p ON p.object = o.id \
             WHERE o.owneruid = ? AND json_extract(o.data, '$.name') = ?",
            OBJECT_COLUMNS
        );
        sqlx::query(&stmt)
            .bind(uid as i64)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| object_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("object '{}' of uid {}", name, uid)))
    }

    /// Unordered substring match on the `name` data field.
    pub async fn search_by_name(&self, term: &str) -> Result<Vec<Object>> {
        let stmt = format!(
            "SELECT {} FROM objects o LEFT JOIN permissions p ON p.object = o.id \
             WHERE json_extract(o.data, '$.name') LIKE ?",
            OBJECT_COLUMNS
        );
        let rows = sqlx::query(&stmt)
            .bind(format!("%{}%", term))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(object_from_row).collect()
    }

    /// Persists a new object (assigning its id) or updates an existing
    /// one. The fingerprint is recomputed either way.
    pub async fn save(&self, obj: &mut Object) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_object(&mut tx, obj).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fetches the avatar for `uid`, creating it (plus its private
    /// bedroom) in one transaction when this uid has never logged in.
    /// Repeated calls return the same object.
    pub async fn ensure_avatar(&self, uid: u32, name: &str) -> Result<Object> {
        if let Ok(avatar) = self.avatar_for_uid(uid).await {
            return Ok(avatar);
        }

        let smell = SMELLS[rand::thread_rng().gen_range(0, SMELLS.len())];
        let mut avatar = Object::new(
            name,
            &format!("a gaseous form. it smells faintly of {}.", smell),
        )
        .with_script(AVATAR_SCRIPT);
        avatar.avatar = true;
        avatar.owner_uid = uid;
        avatar.permissions = Permissions::private();

        let mut bedroom = Object::new("your private bedroom", "a quiet room all your own.");
        bedroom.bedroom = true;
        bedroom.owner_uid = uid;
        bedroom.permissions = Permissions::private();

        let mut tx = self.pool.begin().await?;
        upsert_object(&mut tx, &mut avatar).await?;
        upsert_object(&mut tx, &mut bedroom).await?;
        tx.commit().await?;

        debug!(self.logger, "rezzed avatar"; "uid" => uid, "id" => avatar.id.0);
        Ok(avatar)
    }

    pub async fn avatar_for_uid(&self, uid: u32) -> Result<Object> {
        let stmt = format!(
            "SELECT {} FROM objects o LEFT JOIN permissions p ON p.object = o.id \
             WHERE o.avatar AND o.owneruid = ? LIMIT 1",
            OBJECT_COLUMNS
        );
        sqlx::query(&stmt)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| object_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("avatar for uid {}", uid)))
    }

    /// Removes the avatar's containment edge. The object row survives so
    /// the next login picks the avatar back up.
    pub async fn derez(&self, uid: u32) -> Result<()> {
        match self.avatar_for_uid(uid).await {
            Ok(avatar) => {
                sqlx::query("DELETE FROM contains WHERE contained = ?")
                    .bind(avatar.id.0)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            Err(err) => {
                warn!(self.logger, "derez found no avatar"; "uid" => uid, "err" => %err);
                Ok(())
            }
        }
    }

    /// Atomic "drop any existing edge, insert the new one". Refuses moves
    /// that would make the containment graph cyclic.
    pub async fn move_into(&self, moved: ObjectId, container: ObjectId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // walk the chain upward from the target container
        let mut cursor = container;
        loop {
            if cursor == moved {
                return Err(Error::CycleDetected { moved, container });
            }
            let above: Option<i64> =
                sqlx::query("SELECT container FROM contains WHERE contained = ?")
                    .bind(cursor.0)
                    .fetch_optional(&mut tx)
                    .await?
                    .map(|row| row.get(0));
            match above {
                Some(id) => cursor = ObjectId(id),
                None => break,
            }
        }

        sqlx::query("DELETE FROM contains WHERE contained = ?")
            .bind(moved.0)
            .execute(&mut tx)
            .await?;
        sqlx::query("INSERT INTO contains (contained, container) VALUES (?, ?)")
            .bind(moved.0)
            .bind(container.0)
            .execute(&mut tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Immediate children of a container.
    pub async fn contents(&self, container: ObjectId) -> Result<Vec<Object>> {
        let stmt = format!(
            "SELECT {} FROM objects o LEFT JOIN permissions p ON p.object = o.id \
             WHERE o.id IN (SELECT contained FROM contains WHERE container = ?)",
            OBJECT_COLUMNS
        );
        let rows = sqlx::query(&stmt)
            .bind(container.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(object_from_row).collect()
    }

    pub async fn container_of(&self, contained: ObjectId) -> Result<Object> {
        let stmt = format!(
            "SELECT {} FROM objects o LEFT JOIN permissions p ON p.object = o.id \
             WHERE o.id = (SELECT container FROM contains WHERE contained = ? LIMIT 1)",
            OBJECT_COLUMNS
        );
        sqlx::query(&stmt)
            .bind(contained.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| object_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("container of {}", contained)))
    }

    /// The set of objects that observe a verb issued from `vantage`: its
    /// container plus everything inside that container, always including
    /// the vantage itself. A vantage with no container (a room) only
    /// hears itself.
    pub async fn earshot(&self, vantage: &Object) -> Result<Vec<Object>> {
        let room = match self.container_of(vantage.id).await {
            Ok(room) => room,
            Err(Error::NotFound(_)) => return Ok(vec![vantage.clone()]),
            Err(err) => return Err(err),
        };

        let mut heard = self.contents(room.id).await?;
        if !heard.iter().any(|o| o.id == vantage.id) {
            heard.push(vantage.clone());
        }
        heard.insert(0, room);
        Ok(heard)
    }

    /// Earshot filtered by `term`: name substring, or the exact object id.
    pub async fn resolve(&self, vantage: &Object, term: &str) -> Result<Vec<Object>> {
        let term = term.trim();
        let by_id: Option<i64> = term.parse().ok();
        let matches = self
            .earshot(vantage)
            .await?
            .into_iter()
            .filter(|o| o.name().contains(term) || Some(o.id.0) == by_id)
            .collect();
        Ok(matches)
    }

    /// Creates the default world, owned by uid 0, if any of it is
    /// missing: the foyer, the pub, the oak door between them, the floor
    /// egg, and the root avatar.
    pub async fn ensure_defaults(&self) -> Result<()> {
        let foyer = self
            .ensure_named(0, "foyer", |name| {
                Object::new(
                    name,
                    "a big room. the ceiling is painted with constellations.",
                )
            })
            .await?;

        let pub_room = self
            .ensure_named(0, "pub", |name| {
                Object::new(name, "a warm pub constructed of hard wood and brass")
            })
            .await?;

        let egg = self
            .ensure_named(0, "floor egg", |name| {
                Object::new(name, "it's an egg and it's on the floor.")
            })
            .await?;

        let door_script = format!(
            "provides(\"knock .*\", |_| tellSender(\"the door rattles on its hinges\"));\n\
             goes(\"north\", {});\n",
            pub_room.id.0
        );
        let oak_door = self
            .ensure_named(0, "oak door", move |name| {
                Object::new(
                    name,
                    "a heavy oak door with a brass handle. an ornate sign says PUB.",
                )
                .with_script(&door_script)
            })
            .await?;

        let root = self.ensure_avatar(0, "root").await?;

        for id in [root.id, egg.id, oak_door.id].iter() {
            if let Err(Error::NotFound(_)) = self.container_of(*id).await {
                self.move_into(*id, foyer.id).await?;
            }
        }

        debug!(self.logger, "default world ensured"; "foyer" => foyer.id.0);
        Ok(())
    }

    async fn ensure_named<F>(&self, uid: u32, name: &str, build: F) -> Result<Object>
    where
        F: FnOnce(&str) -> Object,
    {
        match self.get_object_by_owner_name(uid, name).await {
            Ok(obj) => Ok(obj),
            Err(Error::NotFound(_)) => {
                let mut obj = build(name);
                obj.owner_uid = uid;
                self.save(&mut obj).await?;
                Ok(obj)
            }
            Err(err) => Err(err),
        }
    }
}

async fn upsert_object(tx: &mut Transaction<'_, Sqlite>, obj: &mut Object) -> Result<()> {
    obj.refresh_fingerprint();
    let data = serde_json::to_string(&obj.data)
        .map_err(|err| Error::Internal(format!("encoding object data: {}", err)))?;

    if obj.id.0 == 0 {
        let res = sqlx::query(
            "INSERT INTO objects (avatar, bedroom, data, owneruid, script) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(obj.avatar)
        .bind(obj.bedroom)
        .bind(&data)
        .bind(obj.owner_uid as i64)
        .bind(&obj.script)
        .execute(&mut *tx)
        .await?;
        obj.id = ObjectId(res.last_insert_rowid());
    } else {
        sqlx::query(
            "UPDATE objects SET avatar = ?, bedroom = ?, data = ?, owneruid = ?, script = ? \
             WHERE id = ?",
        )
        .bind(obj.avatar)
        .bind(obj.bedroom)
        .bind(&data)
        .bind(obj.owner_uid as i64)
        .bind(&obj.script)
        .bind(obj.id.0)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO permissions (object, read_perm, write_perm, carry_perm, exec_perm) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(object) DO UPDATE SET \
         read_perm = excluded.read_perm, write_perm = excluded.write_perm, \
         carry_perm = excluded.carry_perm, exec_perm = excluded.exec_perm",
    )
    .bind(obj.id.0)
    .bind(obj.permissions.read.as_str())
    .bind(obj.permissions.write.as_str())
    .bind(obj.permissions.carry.as_str())
    .bind(obj.permissions.execute.as_str())
    .execute(&mut *tx)
    .await?;

    Ok(())
}

fn object_from_row(row: &SqliteRow) -> Result<Object> {
    let data: String = row.try_get("data")?;
    let data: HashMap<String, String> = serde_json::from_str(&data)
        .map_err(|err| Error::Internal(format!("decoding object data: {}", err)))?;

    let perm = |column: &str| -> Result<Perm> {
        let raw: Option<String> = row.try_get(column)?;
        match raw {
            Some(raw) => Perm::parse(&raw)
                .ok_or_else(|| Error::Internal(format!("bad permission '{}'", raw))),
            None => Ok(Perm::World),
        }
    };

    let mut obj = Object {
        id: ObjectId(row.try_get("id")?),
        owner_uid: row.try_get::<i64, _>("owneruid")? as u32,
        avatar: row.try_get("avatar")?,
        bedroom: row.try_get("bedroom")?,
        data,
        permissions: Permissions {
            read: perm("read_perm")?,
            write: perm("write_perm")?,
            carry: perm("carry_perm")?,
            execute: perm("exec_perm")?,
        },
        script: row.try_get("script")?,
        fingerprint: 0,
    };
    obj.fingerprint = obj.compute_fingerprint();
    Ok(obj)
}
