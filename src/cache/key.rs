//! Cache key scoping.
//!
//! Layout: `cache_<entity>_<owner>[_<record>]`, metadata at `<key>_meta`.
//! Owner and record segments escape `%` and `_`, and a segment spelled
//! `meta` is escaped too, so a value key never ends in `_meta` and every key
//! parses back into exactly one `(entity, owner, record)` triple.

use std::fmt;

use crate::models::EntityType;

const PREFIX: &str = "cache_";
const META_SUFFIX: &str = "_meta";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  pub entity: EntityType,
  pub owner: String,
  pub record: Option<String>,
}

impl CacheKey {
  /// Key of a single record inside an owner's collection.
  pub fn record(entity: EntityType, owner: &str, record_id: &str) -> Self {
    Self {
      entity,
      owner: owner.to_string(),
      record: Some(record_id.to_string()),
    }
  }

  /// Key of a per-owner singleton, or the listing marker of a collection.
  pub fn owner(entity: EntityType, owner: &str) -> Self {
    Self {
      entity,
      owner: owner.to_string(),
      record: None,
    }
  }

  /// True for the marker that tracks when a collection was last listed.
  pub fn is_collection_marker(&self) -> bool {
    self.record.is_none() && !self.entity.is_singleton()
  }

  /// Id the remote store knows this entity by.
  pub fn remote_id(&self) -> &str {
    self.record.as_deref().unwrap_or(&self.owner)
  }

  pub fn meta_key(&self) -> String {
    format!("{}{}", self, META_SUFFIX)
  }

  /// Raw-key prefix shared by every record of an owner's collection.
  pub fn collection_prefix(entity: EntityType, owner: &str) -> String {
    format!("{}{}_{}_", PREFIX, entity.as_str(), encode_segment(owner))
  }

  /// Parse a raw value key. Metadata keys and foreign keys yield `None`.
  pub fn parse(raw: &str) -> Option<Self> {
    if is_meta_key(raw) {
      return None;
    }
    let rest = raw.strip_prefix(PREFIX)?;
    let mut parts = rest.split('_');

    let entity = parts.next()?.parse::<EntityType>().ok()?;
    let owner = decode_segment(parts.next()?)?;
    let record = match parts.next() {
      Some(segment) => Some(decode_segment(segment)?),
      None => None,
    };
    if parts.next().is_some() {
      return None;
    }
    // Singletons never carry a record segment
    if entity.is_singleton() && record.is_some() {
      return None;
    }

    Some(Self {
      entity,
      owner,
      record,
    })
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}{}_{}",
      PREFIX,
      self.entity.as_str(),
      encode_segment(&self.owner)
    )?;
    if let Some(record) = &self.record {
      write!(f, "_{}", encode_segment(record))?;
    }
    Ok(())
  }
}

/// True for the metadata half of an entry.
pub fn is_meta_key(raw: &str) -> bool {
  raw.starts_with(PREFIX) && raw.ends_with(META_SUFFIX)
}

fn encode_segment(segment: &str) -> String {
  if segment == "meta" {
    return "%6Deta".to_string();
  }
  let mut out = String::with_capacity(segment.len());
  for c in segment.chars() {
    match c {
      '%' => out.push_str("%25"),
      '_' => out.push_str("%5F"),
      c => out.push(c),
    }
  }
  out
}

fn decode_segment(segment: &str) -> Option<String> {
  let bytes = segment.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' {
      let hex = segment.get(i + 1..i + 3)?;
      out.push(u8::from_str_radix(hex, 16).ok()?);
      i += 3;
    } else {
      out.push(bytes[i]);
      i += 1;
    }
  }
  String::from_utf8(out).ok()
}
