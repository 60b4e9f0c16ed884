use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use super::{ChunkIndices, IdError, IdResult, invalid, parse_decimal, unsupported};

/// Multipliers used to spread chunk coordinates across partitions.
const PARTITION_PRIMES: [u64; 10] = [29, 31, 37, 41, 43, 47, 53, 59, 61, 67];

const TOKEN_LEN: usize = 32;
const V1_LAYOUT: [usize; 5] = [8, 4, 4, 4, 12];
const V2_LAYOUT: [usize; 5] = [8, 8, 4, 6, 6];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Schema {
    V1,
    V2,
}

impl Schema {
    fn layout(&self) -> &'static [usize; 5] {
        match self {
            Schema::V1 => &V1_LAYOUT,
            Schema::V2 => &V2_LAYOUT,
        }
    }
}

/// The 32 hex digit body of an id, without its hyphens.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    schema: Schema,
    hex: String,
}

fn hex_rot(ch: char) -> char {
    let value = ch.to_digit(16).unwrap_or(0);
    char::from_digit((value + 8) % 16, 16).unwrap_or('0')
}

fn random_hex() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Token {
    pub fn from_hex(schema: Schema, hex: &str) -> IdResult<Token> {
        if hex.len() != TOKEN_LEN
            || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid(hex, "token must be 32 lowercase hex digits"));
        }
        Ok(Token { schema, hex: hex.to_string() })
    }

    pub fn new_v1() -> Token {
        let mut hex = random_hex();
        // version nibble of a random UUID
        hex.replace_range(12..13, "4");
        Token { schema: Schema::V1, hex }
    }

    pub fn new_v2_root() -> Token {
        let head: String = random_hex().chars().take(16).collect();
        Token { schema: Schema::V2, hex: Self::with_rotated_tail(&head) }
    }

    /// A fresh v2 token sharing its first 16 digits with `root`.
    pub fn new_v2_child(root: &Token) -> Token {
        let tail: String = random_hex().chars().skip(16).collect();
        Token { schema: Schema::V2, hex: format!("{}{tail}", root.head()) }
    }

    fn with_rotated_tail(head: &str) -> String {
        let tail: String = head.chars().map(hex_rot).collect();
        format!("{head}{tail}")
    }

    pub fn schema(&self) -> Schema {
        self.schema
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First 16 digits, shared by every v2 object under the same root.
    pub fn head(&self) -> &str {
        &self.hex[..16]
    }

    pub fn tail(&self) -> &str {
        &self.hex[16..]
    }

    pub fn is_root_pattern(&self) -> bool {
        self.head().chars().zip(self.tail().chars()).all(|(h, t)| h == hex_rot(t))
    }

    /// The root token this token belongs to.
    pub fn rooted(&self) -> Token {
        Token { schema: self.schema, hex: Self::with_rotated_tail(self.head()) }
    }

    /// Parse the hyphenated form, detecting the schema from where the hyphens are.
    fn parse(s: &str) -> IdResult<Token> {
        let lens: Vec<usize> = s.split('-').map(str::len).collect();
        let schema = if lens == V1_LAYOUT {
            Schema::V1
        } else if lens == V2_LAYOUT {
            Schema::V2
        } else {
            return Err(invalid(s, "unexpected uuid layout"));
        };
        Token::from_hex(schema, &s.replace('-', ""))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pos = 0;
        for (i, len) in self.schema.layout().iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            f.write_str(&self.hex[pos..pos + len])?;
            pos += len;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Group,
    Dataset,
    Datatype,
}

/// A parsed object identifier.
///
/// `Display` renders the exact string persisted by the service and `FromStr` accepts only
/// strings that render back identically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// Absolute domain path, e.g. `/home/test_user1/file.h5`
    Domain(String),
    Group(Token),
    Dataset(Token),
    Datatype(Token),
    Chunk { token: Token, partition: Option<u32>, coord: ChunkIndices },
}

impl ObjectId {
    pub fn new_root() -> ObjectId {
        ObjectId::Group(Token::new_v2_root())
    }

    pub fn new_v1(kind: ObjectKind) -> ObjectId {
        Self::of_kind(kind, Token::new_v1())
    }

    /// Create a new object belonging to the domain rooted at `root`.
    ///
    /// Roots from schema v1 domains produce v1 ids.
    pub fn new_object(kind: ObjectKind, root: &ObjectId) -> IdResult<ObjectId> {
        match root {
            ObjectId::Group(token) if token.schema == Schema::V1 => Ok(Self::new_v1(kind)),
            ObjectId::Group(token) => Ok(Self::of_kind(kind, Token::new_v2_child(token))),
            other => Err(invalid(&other.to_string(), "root must be a group id")),
        }
    }

    fn of_kind(kind: ObjectKind, token: Token) -> ObjectId {
        match kind {
            ObjectKind::Group => ObjectId::Group(token),
            ObjectKind::Dataset => ObjectId::Dataset(token),
            ObjectKind::Datatype => ObjectId::Datatype(token),
        }
    }

    pub fn domain(path: &str) -> IdResult<ObjectId> {
        if !path.starts_with('/')
            || path.len() < 2
            || path.ends_with('/')
            || path.contains("//")
        {
            return Err(invalid(path, "domain must be an absolute path without a trailing slash"));
        }
        Ok(ObjectId::Domain(path.to_string()))
    }

    /// Id of the chunk at `coord` of `dataset`.
    pub fn chunk(dataset: &ObjectId, coord: ChunkIndices) -> IdResult<ObjectId> {
        match dataset {
            ObjectId::Dataset(token) => {
                if coord.rank() == 0 {
                    return Err(invalid(&dataset.to_string(), "chunk coordinate is empty"));
                }
                Ok(ObjectId::Chunk { token: token.clone(), partition: None, coord })
            }
            other => Err(invalid(&other.to_string(), "not a dataset id")),
        }
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            ObjectId::Domain(_) => None,
            ObjectId::Group(token)
            | ObjectId::Dataset(token)
            | ObjectId::Datatype(token)
            | ObjectId::Chunk { token, .. } => Some(token),
        }
    }

    pub fn schema(&self) -> Option<Schema> {
        self.token().map(Token::schema)
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, ObjectId::Chunk { .. })
    }

    pub fn collection(&self) -> &'static str {
        match self {
            ObjectId::Domain(_) => "domains",
            ObjectId::Group(_) => "groups",
            ObjectId::Dataset(_) => "datasets",
            ObjectId::Datatype(_) => "datatypes",
            ObjectId::Chunk { .. } => "chunks",
        }
    }

    pub fn dataset_id(&self) -> IdResult<ObjectId> {
        match self {
            ObjectId::Chunk { token, .. } => Ok(ObjectId::Dataset(token.clone())),
            other => Err(invalid(&other.to_string(), "not a chunk id")),
        }
    }

    pub fn chunk_coordinate(&self) -> IdResult<&ChunkIndices> {
        match self {
            ObjectId::Chunk { coord, .. } => Ok(coord),
            other => Err(invalid(&other.to_string(), "not a chunk id")),
        }
    }

    pub fn partition(&self) -> Option<u32> {
        match self {
            ObjectId::Chunk { partition, .. } => *partition,
            _ => None,
        }
    }

    /// Mix the partition index into a chunk id.
    ///
    /// Ids that already carry a partition, and counts below two, leave the id unchanged.
    pub fn partitioned(&self, partition_count: u32) -> IdResult<ObjectId> {
        let ObjectId::Chunk { token, partition, coord } = self else {
            return Err(invalid(&self.to_string(), "not a chunk id"));
        };
        if partition.is_some() || partition_count < 2 {
            return Ok(self.clone());
        }
        let sum: u128 = coord
            .0
            .iter()
            .enumerate()
            .map(|(dim, i)| {
                *i as u128 * PARTITION_PRIMES[dim % PARTITION_PRIMES.len()] as u128
            })
            .sum();
        let index = (sum % partition_count as u128) as u32;
        Ok(ObjectId::Chunk { token: token.clone(), partition: Some(index), coord: coord.clone() })
    }

    /// Only schema v2 groups can be roots.
    pub fn is_root(&self) -> IdResult<bool> {
        match self {
            ObjectId::Domain(path) => Err(invalid(path, "domains have no root")),
            other if other.schema() == Some(Schema::V1) => {
                Err(unsupported(&other.to_string(), "root detection requires a v2 id"))
            }
            ObjectId::Group(token) => Ok(token.is_root_pattern()),
            _ => Ok(false),
        }
    }

    pub fn root_id(&self) -> IdResult<ObjectId> {
        if self.is_root()? {
            return Ok(self.clone());
        }
        match self.token() {
            Some(token) => Ok(ObjectId::Group(token.rooted())),
            None => Err(invalid(&self.to_string(), "domains have no root")),
        }
    }

    fn prefix(&self) -> char {
        match self {
            ObjectId::Domain(_) => '/',
            ObjectId::Group(_) => 'g',
            ObjectId::Dataset(_) => 'd',
            ObjectId::Datatype(_) => 't',
            ObjectId::Chunk { .. } => 'c',
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Domain(path) => f.write_str(path),
            ObjectId::Chunk { token, partition, coord } => {
                f.write_str("c")?;
                if let Some(p) = partition {
                    write!(f, "{p}")?;
                }
                write!(f, "-{token}_{coord}")
            }
            other => match other.token() {
                Some(token) => write!(f, "{}-{token}", other.prefix()),
                None => Ok(()),
            },
        }
    }
}

impl FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return ObjectId::domain(s);
        }
        let Some((head, body)) = s.split_once('-') else {
            return Err(invalid(s, "missing type prefix"));
        };
        match head {
            "g" => Ok(ObjectId::Group(Token::parse(body)?)),
            "d" => Ok(ObjectId::Dataset(Token::parse(body)?)),
            "t" => Ok(ObjectId::Datatype(Token::parse(body)?)),
            _ if head.starts_with('c') => {
                let partition = match &head[1..] {
                    "" => None,
                    digits => {
                        let p = parse_decimal(digits)
                            .and_then(|p| u32::try_from(p).ok())
                            .ok_or_else(|| invalid(s, "bad chunk partition"))?;
                        Some(p)
                    }
                };
                let Some((uuid, coord)) = body.split_once('_') else {
                    return Err(invalid(s, "chunk id without coordinate"));
                };
                let token = Token::parse(uuid)?;
                let coord = coord.parse().map_err(|_| invalid(s, "bad chunk coordinate"))?;
                Ok(ObjectId::Chunk { token, partition, coord })
            }
            _ => Err(invalid(s, "unknown type prefix")),
        }
    }
}

impl TryFrom<&str> for ObjectId {
    type Error = IdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(|e: IdError| serde::de::Error::custom(e.kind))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::{prop_assert, prop_assert_eq};
    use test_strategy::proptest;

    use super::*;
    use crate::{format::IdErrorKind, strategies::*};

    #[test]
    fn test_parse_known_ids() {
        let v1 = "d-be5e2b34-7f5a-11e8-aa3f-0242ac120004";
        let id: ObjectId = v1.parse().unwrap();
        assert_eq!(id.schema(), Some(Schema::V1));
        assert_eq!(id.collection(), "datasets");
        assert_eq!(id.to_string(), v1);

        let v2 = "g-1e3ffc6a-21d14d4c-9e3f-9e3e9e-3e4ec7";
        let id: ObjectId = v2.parse().unwrap();
        assert_eq!(id.schema(), Some(Schema::V2));
        assert_eq!(id.to_string(), v2);

        let chunk = "c12-be5e2b34-7f5a-11e8-aa3f-0242ac120004_6_4";
        let id: ObjectId = chunk.parse().unwrap();
        assert!(id.is_chunk());
        assert_eq!(id.partition(), Some(12));
        assert_eq!(id.chunk_coordinate().unwrap(), &ChunkIndices(vec![6, 4]));
        assert_eq!(id.dataset_id().unwrap().to_string(), v1);
        assert_eq!(id.to_string(), chunk);
    }

    #[test]
    fn test_reject_malformed_ids() {
        for bad in [
            "",
            "x-be5e2b34-7f5a-11e8-aa3f-0242ac120004",
            "d-be5e2b34-7f5a-11e8-aa3f",
            "d-BE5E2B34-7F5A-11E8-AA3F-0242AC120004",
            "d-be5e2b34-7f5a-11e8-aa3f-0242ac12000z",
            "c-be5e2b34-7f5a-11e8-aa3f-0242ac120004",
            "c-be5e2b34-7f5a-11e8-aa3f-0242ac120004_",
            "c01-be5e2b34-7f5a-11e8-aa3f-0242ac120004_1",
            "/home/",
            "/",
        ] {
            let err = bad.parse::<ObjectId>().unwrap_err();
            assert!(
                matches!(err.kind(), IdErrorKind::InvalidIdentifier { .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn test_root_detection() {
        let root = ObjectId::new_root();
        assert!(root.is_root().unwrap());
        assert_eq!(root.root_id().unwrap(), root);

        let dset = ObjectId::new_object(ObjectKind::Dataset, &root).unwrap();
        assert!(!dset.is_root().unwrap());
        assert_eq!(dset.root_id().unwrap(), root);

        let v1 = ObjectId::new_v1(ObjectKind::Group);
        let err = v1.is_root().unwrap_err();
        assert!(matches!(err.kind(), IdErrorKind::UnsupportedOperation { .. }));
        assert!(v1.root_id().is_err());
    }

    #[test]
    fn test_partition_mixin() {
        let dset: ObjectId = "d-be5e2b34-7f5a-11e8-aa3f-0242ac120004".parse().unwrap();
        let chunk = ObjectId::chunk(&dset, ChunkIndices(vec![6, 4])).unwrap();
        // 6 * 29 + 4 * 31 = 298
        let part = chunk.partitioned(16).unwrap();
        assert_eq!(part.partition(), Some(298 % 16));
        assert_eq!(part.to_string(), "c10-be5e2b34-7f5a-11e8-aa3f-0242ac120004_6_4");
        // already partitioned ids are left alone
        assert_eq!(part.partitioned(3).unwrap(), part);
        assert_eq!(chunk.partitioned(1).unwrap(), chunk);
        assert!(dset.partitioned(4).is_err());
    }

    #[proptest]
    fn test_display_parse_roundtrip(#[strategy(object_ids())] id: ObjectId) {
        prop_assert_eq!(id.to_string().parse::<ObjectId>().unwrap(), id);
    }

    #[proptest]
    fn test_children_share_root(#[strategy(v2_roots())] root: ObjectId) {
        prop_assert!(root.is_root().unwrap());
        for kind in [ObjectKind::Group, ObjectKind::Dataset, ObjectKind::Datatype] {
            let child = ObjectId::new_object(kind, &root).unwrap();
            prop_assert_eq!(child.root_id().unwrap(), root.clone());
        }
    }
}
