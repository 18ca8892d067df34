//! Spatial direction tokens used when digging new rooms and by script
//! `goes` handlers.

use crate::Error;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

pub const ALL: [Direction; 6] = [
    Direction::North,
    Direction::South,
    Direction::East,
    Direction::West,
    Direction::Above,
    Direction::Below,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
    Above,
    Below,
}

impl Direction {
    /// Accepts the canonical names plus the human synonyms `up` and `down`.
    pub fn normalize(raw: &str) -> crate::Result<Direction> {
        raw.parse()
    }

    pub fn valid(raw: &str) -> bool {
        raw.parse::<Direction>().is_ok()
    }

    pub fn reverse(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::Above => Direction::Below,
            Direction::Below => Direction::Above,
        }
    }

    pub fn is_vertical(self) -> bool {
        matches!(self, Direction::Above | Direction::Below)
    }

    pub fn human(self) -> &'static str {
        match self {
            Direction::North => "north",
            Direction::South => "south",
            Direction::East => "east",
            Direction::West => "west",
            Direction::Above => "above",
            Direction::Below => "below",
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(raw: &str) -> crate::Result<Direction> {
        let dir = match raw.trim() {
            "north" => Direction::North,
            "south" => Direction::South,
            "east" => Direction::East,
            "west" => Direction::West,
            "above" | "up" => Direction::Above,
            "below" | "down" => Direction::Below,
            _ => return Err(Error::InvalidDirection(raw.to_owned())),
        };
        Ok(dir)
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.human())
    }
}
