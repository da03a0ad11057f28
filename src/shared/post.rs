//! Post, Thread and Board Transport Types
//!
//! These types are exposed publicly through the JSON API and the
//! WebSocket protocol. The composite `Thread` and `Board` types are
//! assembled by the store for the snapshot cache and are not persisted
//! as such.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// A link from one post to another, produced by `>>NNN` references in a
/// finalised body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: u64,
    pub op: u64,
    pub board: String,
}

/// Image metadata attached to a post. Thumbnailing happens outside the
/// core; only the fields the update pipeline needs are carried here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub sha1: String,
    #[serde(default)]
    pub spoiler: bool,
}

/// A hash command parsed from a finalised post body. Outcomes are
/// resolved at close time so the persisted value is authoritative.
///
/// Serialised as `{"type": N, "val": ...}` to match the client protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Die rolls; one entry per die
    Dice(Vec<u16>),
    /// Coin flip
    Flip(bool),
    /// Magic 8 ball answer
    EightBall(String),
    /// Synchronised watching: [hours, minutes, seconds, start, end]
    SyncWatch([u64; 5]),
    /// Incremented pyu counter value
    Pyu(u64),
    /// Current pyu counter value
    Pcount(u64),
    /// Thread roulette loss counter value
    Rcount(u64),
    /// Russian roulette: [outcome, chambers remaining]. Outcome 1 loses.
    Roulette([u8; 2]),
}

impl Command {
    pub fn type_code(&self) -> u8 {
        match self {
            Command::Dice(_) => 0,
            Command::Flip(_) => 1,
            Command::EightBall(_) => 2,
            Command::SyncWatch(_) => 3,
            Command::Pyu(_) => 4,
            Command::Pcount(_) => 5,
            Command::Rcount(_) => 6,
            Command::Roulette(_) => 7,
        }
    }

    fn value(&self) -> Value {
        match self {
            Command::Dice(v) => json!(v),
            Command::Flip(v) => json!(v),
            Command::EightBall(v) => json!(v),
            Command::SyncWatch(v) => json!(v),
            Command::Pyu(v) => json!(v),
            Command::Pcount(v) => json!(v),
            Command::Rcount(v) => json!(v),
            Command::Roulette(v) => json!(v),
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        json!({ "type": self.type_code(), "val": self.value() }).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let typ = raw
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| D::Error::custom("missing command type"))?;
        let val = raw
            .get("val")
            .cloned()
            .ok_or_else(|| D::Error::custom("missing command value"))?;
        fn parse<T: serde::de::DeserializeOwned, E: serde::de::Error>(v: Value) -> Result<T, E> {
            serde_json::from_value(v).map_err(E::custom)
        }
        Ok(match typ {
            0 => Command::Dice(parse(val)?),
            1 => Command::Flip(parse(val)?),
            2 => Command::EightBall(parse(val)?),
            3 => Command::SyncWatch(parse(val)?),
            4 => Command::Pyu(parse(val)?),
            5 => Command::Pcount(parse(val)?),
            6 => Command::Rcount(parse(val)?),
            7 => Command::Roulette(parse(val)?),
            n => return Err(D::Error::custom(format!("unknown command type: {}", n))),
        })
    }
}

/// A generic post exposed publicly through the JSON API. Either OP or
/// reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub editing: bool,
    #[serde(default)]
    pub sage: bool,
    pub id: u64,
    pub time: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,
}

/// A post view that includes the `op` and `board` fields, required for
/// retrieving a post with unknown parenthood.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandalonePost {
    #[serde(flatten)]
    pub post: Post,
    pub op: u64,
    pub board: String,
}

/// Transport wrapper storing thread metadata, its opening post and its
/// contained posts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(default)]
    pub abbrev: bool,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub locked: bool,
    pub post_count: u32,
    pub image_count: u32,
    pub update_time: i64,
    pub bump_time: i64,
    pub subject: String,
    pub board: String,
    #[serde(flatten)]
    pub post: Post,
    #[serde(default)]
    pub posts: Vec<Post>,
}

/// A page of a board index or a full catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub pages: u32,
    pub threads: Vec<Thread>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let c = Command::Roulette([1, 6]);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"type":7,"val":[1,6]}"#);
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn test_command_flip_round_trip() {
        let c = Command::Flip(true);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"type":1,"val":true}"#);
        assert_eq!(c, serde_json::from_str::<Command>(&json).unwrap());
    }

    #[test]
    fn test_unknown_command_type_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"type":9,"val":1}"#).is_err());
    }

    #[test]
    fn test_standalone_post_flattens_post_fields() {
        let p = StandalonePost {
            post: Post {
                id: 2,
                time: 1,
                body: "abc".to_string(),
                editing: true,
                ..Default::default()
            },
            op: 1,
            board: "a".to_string(),
        };
        let v: Value = serde_json::to_value(&p).unwrap();
        assert_eq!(v["id"], 2);
        assert_eq!(v["op"], 1);
        assert_eq!(v["board"], "a");
    }
}
