//! Storage keys for objects and chunks.
//!
//! ```text
//! v1:        <md5(id)[0:5]>-<id>
//! v2 root:   db/<t0:8>-<t8:16>/.group.json
//! v2 object: db/<t0:8>-<t8:16>/<g|d|t>/<t16:20>-<t20:26>-<t26:32>/.<kind>.json
//! v2 chunk:  db/<t0:8>-<t8:16>/d/<t16:20>-<t20:26>-<t26:32>[/p<partition>]/<i_j_k>
//! domain:    <path without leading slash>/.domain.json
//! ```
use super::{
    ChunkIndices, IdResult, ObjectId, Schema, Token, invalid, object_id::ObjectKind,
    parse_decimal,
};

const DOMAIN_SUFFIX: &str = "/.domain.json";
const GROUP_FILE: &str = ".group.json";
const DATASET_FILE: &str = ".dataset.json";
const DATATYPE_FILE: &str = ".datatype.json";
const V2_PREFIX: &str = "db/";
const V1_MIN_KEY_LEN: usize = 44;

fn v1_hash(id: &str) -> String {
    let digest = format!("{:x}", md5::compute(id.as_bytes()));
    digest.chars().take(5).collect()
}

fn root_folder(token: &Token) -> String {
    let hex = token.hex();
    format!("{V2_PREFIX}{}-{}", &hex[0..8], &hex[8..16])
}

fn object_folder(token: &Token, collection: char) -> String {
    let hex = token.hex();
    format!(
        "{}/{collection}/{}-{}-{}",
        root_folder(token),
        &hex[16..20],
        &hex[20..26],
        &hex[26..32]
    )
}

pub fn id_to_key(id: &ObjectId) -> String {
    if let ObjectId::Domain(path) = id {
        let path = path.strip_prefix('/').unwrap_or(path);
        return format!("{path}{DOMAIN_SUFFIX}");
    }
    if id.schema() == Some(Schema::V1) {
        let id = id.to_string();
        return format!("{}-{id}", v1_hash(&id));
    }
    match id {
        ObjectId::Group(token) if token.is_root_pattern() => {
            format!("{}/{GROUP_FILE}", root_folder(token))
        }
        ObjectId::Group(token) => format!("{}/{GROUP_FILE}", object_folder(token, 'g')),
        ObjectId::Dataset(token) => format!("{}/{DATASET_FILE}", object_folder(token, 'd')),
        ObjectId::Datatype(token) => {
            format!("{}/{DATATYPE_FILE}", object_folder(token, 't'))
        }
        ObjectId::Chunk { token, partition, coord } => {
            let folder = object_folder(token, 'd');
            match partition {
                Some(p) => format!("{folder}/p{p}/{coord}"),
                None => format!("{folder}/{coord}"),
            }
        }
        ObjectId::Domain(_) => String::new(),
    }
}

fn parse_root_part(key: &str, part: &str) -> IdResult<String> {
    match part.split_once('-') {
        Some((a, b)) if a.len() == 8 && b.len() == 8 => Ok(format!("{a}{b}")),
        _ => Err(invalid(key, "bad root folder")),
    }
}

fn parse_object_part(key: &str, part: &str) -> IdResult<String> {
    let pieces: Vec<&str> = part.split('-').collect();
    match pieces.as_slice() {
        [a, b, c] if a.len() == 4 && b.len() == 6 && c.len() == 6 => Ok(pieces.concat()),
        _ => Err(invalid(key, "bad object folder")),
    }
}

fn parse_v2_key(key: &str, rest: &str) -> IdResult<ObjectId> {
    let parts: Vec<&str> = rest.split('/').collect();
    let head = parse_root_part(key, parts.first().copied().unwrap_or_default())?;

    match parts.as_slice() {
        [_, file] if *file == GROUP_FILE => {
            // the tail of a root token is implied by its head
            let token = Token::from_hex(Schema::V2, &format!("{head}{head}"))?.rooted();
            Ok(ObjectId::Group(token))
        }
        [_, collection, object, last] => {
            let token =
                Token::from_hex(Schema::V2, &format!("{head}{}", parse_object_part(key, object)?))?;
            let kind = match (*collection, *last) {
                ("g", GROUP_FILE) => ObjectKind::Group,
                ("t", DATATYPE_FILE) => ObjectKind::Datatype,
                ("d", DATASET_FILE) => ObjectKind::Dataset,
                ("d", coord) => {
                    let coord: ChunkIndices =
                        coord.parse().map_err(|_| invalid(key, "bad chunk coordinate"))?;
                    return Ok(ObjectId::Chunk { token, partition: None, coord });
                }
                _ => return Err(invalid(key, "unexpected collection")),
            };
            Ok(match kind {
                ObjectKind::Group => ObjectId::Group(token),
                ObjectKind::Dataset => ObjectId::Dataset(token),
                ObjectKind::Datatype => ObjectId::Datatype(token),
            })
        }
        [_, "d", object, partition, coord] => {
            let token =
                Token::from_hex(Schema::V2, &format!("{head}{}", parse_object_part(key, object)?))?;
            let partition = partition
                .strip_prefix('p')
                .and_then(parse_decimal)
                .and_then(|p| u32::try_from(p).ok())
                .ok_or_else(|| invalid(key, "bad chunk partition"))?;
            let coord: ChunkIndices =
                coord.parse().map_err(|_| invalid(key, "bad chunk coordinate"))?;
            Ok(ObjectId::Chunk { token, partition: Some(partition), coord })
        }
        _ => Err(invalid(key, "unexpected key layout")),
    }
}

fn parse_v1_key(key: &str) -> Option<IdResult<ObjectId>> {
    let bytes = key.as_bytes();
    if key.len() < V1_MIN_KEY_LEN
        || !bytes[..5].iter().all(u8::is_ascii_alphanumeric)
        || bytes[5] != b'-'
        || !matches!(bytes[6], b'g' | b'd' | b'c' | b't')
    {
        return None;
    }
    let (hash, id_str) = (&key[..5], &key[6..]);
    let parsed = id_str.parse::<ObjectId>().and_then(|id| {
        if id.schema() != Some(Schema::V1) {
            Err(invalid(key, "hashed key for a non v1 id"))
        } else if v1_hash(id_str) != hash {
            Err(invalid(key, "key hash does not match id"))
        } else {
            Ok(id)
        }
    });
    Some(parsed)
}

/// Inverse of [`id_to_key`]. Keys that would not be produced by `id_to_key` are rejected.
pub fn key_to_id(key: &str) -> IdResult<ObjectId> {
    let id = if let Some(path) = key.strip_suffix(DOMAIN_SUFFIX) {
        ObjectId::domain(&format!("/{path}"))?
    } else if let Some(rest) = key.strip_prefix(V2_PREFIX) {
        parse_v2_key(key, rest)?
    } else if let Some(parsed) = parse_v1_key(key) {
        parsed?
    } else {
        return Err(invalid(key, "not an object key"));
    };

    if id_to_key(&id) != key {
        return Err(invalid(key, "non canonical key"));
    }
    Ok(id)
}

impl ObjectId {
    pub fn key(&self) -> String {
        id_to_key(self)
    }

    pub fn from_key(key: &str) -> IdResult<ObjectId> {
        key_to_id(key)
    }
}
