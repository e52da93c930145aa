//! Raw object -> `NormalizedResource`, including the content fingerprint.
//!
//! The fingerprint covers the object with its volatile metadata blanked, so
//! re-syncs that only bump `resourceVersion`/`generation` hash identically.

use md5::{Digest, Md5};
use serde_json::{Map, Value};

use crate::{catalog, NormalizedResource, OwnerTag, RawResource};

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Metadata fields blanked (not removed) before hashing.
const VOLATILE_METADATA: &[&str] = &["resourceVersion", "creationTimestamp", "generation"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedResource {
    #[error("malformed resource: empty document")]
    Empty,
    #[error("malformed resource: missing {0}")]
    MissingField(&'static str),
    #[error("malformed resource: no payload shape for {api_version}/{kind}")]
    UnknownKind { api_version: String, kind: String },
    #[error("malformed resource: {0}")]
    Shape(&'static str),
}

/// How kinds outside the catalog are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Reject kinds without a typed payload shape.
    Strict,
    /// Forward unknown kinds as generic documents.
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    owner: OwnerTag,
    mode: PayloadMode,
}

impl Normalizer {
    pub fn new(owner: OwnerTag, mode: PayloadMode) -> Self { Self { owner, mode } }

    pub fn owner(&self) -> &OwnerTag { &self.owner }

    pub fn normalize(&self, raw: RawResource) -> Result<NormalizedResource, MalformedResource> {
        let mut doc = match raw {
            Value::Object(map) if !map.is_empty() => map,
            Value::Object(_) | Value::Null => return Err(MalformedResource::Empty),
            _ => return Err(MalformedResource::Shape("document is not an object")),
        };

        let api_version = str_field(&doc, "apiVersion").ok_or(MalformedResource::MissingField("apiVersion"))?;
        let kind = str_field(&doc, "kind").ok_or(MalformedResource::MissingField("kind"))?;
        let meta = match doc.get_mut("metadata") {
            Some(Value::Object(meta)) => meta,
            Some(_) => return Err(MalformedResource::Shape("metadata is not an object")),
            None => return Err(MalformedResource::MissingField("metadata")),
        };
        let identifier = match meta.get("uid").and_then(Value::as_str) {
            Some(uid) if !uid.is_empty() => uid.to_string(),
            _ => return Err(MalformedResource::MissingField("metadata.uid")),
        };

        if catalog::is_known_kind(&api_version, &kind) {
            if !meta.get("name").map_or(false, Value::is_string) {
                return Err(MalformedResource::MissingField("metadata.name"));
            }
        } else if self.mode == PayloadMode::Strict {
            return Err(MalformedResource::UnknownKind { api_version, kind });
        }

        strip_volatile(meta);
        let content_hash = content_hash(&mut doc);

        Ok(NormalizedResource {
            identifier,
            api_version,
            kind,
            content_hash,
            owner: self.owner.clone(),
            payload: Value::Object(doc),
        })
    }
}

fn str_field(doc: &Map<String, Value>, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Removes fields that never belong in the forwarded payload.
fn strip_volatile(meta: &mut Map<String, Value>) {
    #[cfg(feature = "strip-managed-fields")]
    meta.remove("managedFields");

    let now_empty = match meta.get_mut("annotations") {
        Some(Value::Object(annotations)) => {
            annotations.remove(LAST_APPLIED_ANNOTATION);
            annotations.is_empty()
        }
        _ => false,
    };
    if now_empty {
        meta.remove("annotations");
    }
}

/// Hex MD5 of the canonical serialization, with volatile metadata set to null.
/// The payload's own metadata is restored before returning.
fn content_hash(doc: &mut Map<String, Value>) -> String {
    let saved = match doc.get_mut("metadata") {
        Some(Value::Object(meta)) => {
            let mut blanked = meta.clone();
            for field in VOLATILE_METADATA {
                blanked.insert((*field).to_string(), Value::Null);
            }
            Some(std::mem::replace(meta, blanked))
        }
        _ => None,
    };

    let mut buf = Vec::with_capacity(1024);
    write_object(&mut buf, doc);
    let digest = Md5::digest(&buf);

    if let (Some(original), Some(Value::Object(meta))) = (saved, doc.get_mut("metadata")) {
        *meta = original;
    }
    hex::encode(digest)
}

/// Compact JSON with object keys in lexicographic order, independent of the
/// map implementation serde_json was built with.
fn write_canonical(buf: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Object(map) => write_object(buf, map),
        Value::Array(items) => {
            buf.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_canonical(buf, item);
            }
            buf.push(b']');
        }
        scalar => write_scalar(buf, scalar),
    }
}

fn write_object(buf: &mut Vec<u8>, map: &Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_unstable();
    buf.push(b'{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        write_scalar(buf, &Value::String(key.clone()));
        buf.push(b':');
        if let Some(v) = map.get(key) {
            write_canonical(buf, v);
        }
    }
    buf.push(b'}');
}

fn write_scalar(buf: &mut Vec<u8>, v: &Value) {
    // Scalars always serialize; writing into a Vec cannot fail.
    let _ = serde_json::to_writer(&mut *buf, v);
}
