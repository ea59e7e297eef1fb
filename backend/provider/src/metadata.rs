//! Runtime event schema and storage-key derivation.
//!
//! The decoder needs to know, for every `(pallet index, event index)` pair
//! that can show up in `System.Events`, the SCALE layout of the event's
//! fields, otherwise it cannot skip over events it does not care about.
//!
//! The schema normally comes from the node itself: `state_getMetadata`
//! returns the runtime metadata (V14/V15), whose type registry is flattened
//! here into [`FieldType`] layouts. A JSON schema (see `schema/events.json`)
//! can be supplied instead; it must name the runtime `spec_version` it was
//! written for.

use std::fmt;

use frame_metadata::v14::{PalletEventMetadata, PalletStorageMetadata};
use frame_metadata::{RuntimeMetadata, RuntimeMetadataPrefixed, META_RESERVED};
use parity_scale_codec::Decode;
use scale_info::form::PortableForm;
use scale_info::{PortableRegistry, TypeDef, TypeDefPrimitive};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::errors::{ChainError, ProviderError, Result};
use crate::events::positional_field_names;

/// Deepest type nesting accepted from a runtime registry.
const MAX_TYPE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMetadata {
    /// Runtime version the schema describes.
    #[serde(default)]
    pub spec_version: Option<u32>,
    pub pallets: Vec<PalletMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PalletMetadata {
    pub name: String,
    pub index: u8,
    /// Storage items exposed by the pallet.
    #[serde(default)]
    pub storage: Vec<String>,
    #[serde(default)]
    pub events: Vec<EventMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub name: String,
    pub index: u8,
    #[serde(default)]
    pub fields: Vec<EventField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventField {
    pub name: String,
    #[serde(flatten)]
    pub ty: FieldType,
}

/// SCALE layout of a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    U128,
    /// Compact-encoded unsigned integer
    Compact,
    /// 32-byte account id
    AccountId,
    H256,
    /// Length-prefixed byte string
    Bytes,
    Array {
        len: usize,
        item: Box<FieldType>,
    },
    #[serde(rename = "vec")]
    Sequence {
        item: Box<FieldType>,
    },
    #[serde(rename = "option")]
    Optional {
        item: Box<FieldType>,
    },
    Composite {
        fields: Vec<FieldType>,
    },
    Variant {
        variants: Vec<VariantLayout>,
    },
    /// `BitVec` with a compact bit count, stored in words of `store_bytes`
    BitSequence {
        store_bytes: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantLayout {
    pub index: u8,
    #[serde(default)]
    pub fields: Vec<FieldType>,
}

impl ChainMetadata {
    /// The schema shipped as `schema/events.json`.
    #[cfg(test)]
    pub fn bundled() -> Result<Self> {
        Self::from_json(include_str!("../schema/events.json"))
    }

    /// Load a JSON schema. It must carry the `spec_version` it targets.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::Config(format!("Cannot read event schema {path}: {e}")))?;
        let schema = Self::from_json(&raw)?;
        if schema.spec_version.is_none() {
            return Err(ProviderError::Config(format!(
                "Event schema {path} does not name a spec_version"
            )));
        }
        Ok(schema)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Build the schema from SCALE-encoded runtime metadata as returned by
    /// `state_getMetadata`.
    pub fn from_runtime_metadata(
        raw: &[u8],
        spec_version: u32,
    ) -> std::result::Result<Self, ChainError> {
        let prefixed = RuntimeMetadataPrefixed::decode(&mut &raw[..])
            .map_err(|e| ChainError::Metadata(format!("cannot decode runtime metadata: {e}")))?;
        if prefixed.0 != META_RESERVED {
            return Err(ChainError::Metadata("runtime metadata magic mismatch".into()));
        }

        let pallets = match &prefixed.1 {
            RuntimeMetadata::V14(m) => m
                .pallets
                .iter()
                .map(|p| {
                    runtime_pallet(&m.types, &p.name, p.index, p.storage.as_ref(), p.event.as_ref())
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            RuntimeMetadata::V15(m) => m
                .pallets
                .iter()
                .map(|p| {
                    runtime_pallet(&m.types, &p.name, p.index, p.storage.as_ref(), p.event.as_ref())
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            other => {
                return Err(ChainError::Metadata(format!(
                    "unsupported runtime metadata version {}",
                    other.version()
                )))
            }
        };

        Ok(Self {
            spec_version: Some(spec_version),
            pallets,
        })
    }

    pub fn pallet(&self, name: &str) -> Option<&PalletMetadata> {
        self.pallets.iter().find(|p| p.name == name)
    }

    /// Resolve the schema of an event by its on-chain indices.
    pub fn event(&self, pallet: u8, event: u8) -> Option<(&PalletMetadata, &EventMetadata)> {
        let p = self.pallets.iter().find(|p| p.index == pallet)?;
        let e = p.events.iter().find(|e| e.index == event)?;
        Some((p, e))
    }

    /// Check the schema against the runtime version reported by the node.
    /// A schema without a version is never accepted.
    pub fn ensure_compatible(&self, runtime_spec_version: u32) -> std::result::Result<(), ChainError> {
        match self.spec_version {
            Some(v) if v == runtime_spec_version => Ok(()),
            Some(v) => Err(ChainError::Metadata(format!(
                "event schema targets spec_version {v}, node runs {runtime_spec_version}"
            ))),
            None => Err(ChainError::Metadata(
                "event schema does not name a spec_version".into(),
            )),
        }
    }

    /// Storage key of a plain (non-map) storage item:
    /// `twox128(pallet) ++ twox128(item)`.
    pub fn storage_key(&self, pallet: &str, item: &str) -> std::result::Result<StorageKey, ChainError> {
        let p = self
            .pallet(pallet)
            .ok_or_else(|| ChainError::Metadata(format!("pallet {pallet} not found")))?;
        if !p.storage.iter().any(|s| s == item) {
            return Err(ChainError::Metadata(format!(
                "pallet {pallet} has no storage item {item}"
            )));
        }
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(&twox128(pallet.as_bytes()));
        key.extend_from_slice(&twox128(item.as_bytes()));
        Ok(StorageKey(key))
    }
}

// ─────────────────────────────────────────────────────────
// Runtime metadata flattening
// ─────────────────────────────────────────────────────────

fn runtime_pallet(
    types: &PortableRegistry,
    name: &str,
    index: u8,
    storage: Option<&PalletStorageMetadata<PortableForm>>,
    event: Option<&PalletEventMetadata<PortableForm>>,
) -> std::result::Result<PalletMetadata, ChainError> {
    let storage = storage
        .map(|s| s.entries.iter().map(|e| e.name.clone()).collect())
        .unwrap_or_default();

    let events = match event {
        None => Vec::new(),
        Some(event) => {
            let ty = resolve(types, event.ty.id)?;
            let TypeDef::Variant(def) = &ty.type_def else {
                return Err(ChainError::Metadata(format!(
                    "event type of pallet {name} is not an enum"
                )));
            };
            def.variants
                .iter()
                .map(|v| {
                    let positional = positional_field_names(name, &v.name);
                    let fields = v
                        .fields
                        .iter()
                        .enumerate()
                        .map(|(i, f)| {
                            let field_name = match (&f.name, positional.and_then(|p| p.get(i))) {
                                (Some(n), _) => n.clone(),
                                (None, Some(n)) => n.to_string(),
                                (None, None) => i.to_string(),
                            };
                            Ok(EventField {
                                name: field_name,
                                ty: layout(types, f.ty.id, 0)?,
                            })
                        })
                        .collect::<std::result::Result<_, ChainError>>()?;
                    Ok(EventMetadata {
                        name: v.name.clone(),
                        index: v.index,
                        fields,
                    })
                })
                .collect::<std::result::Result<_, ChainError>>()?
        }
    };

    Ok(PalletMetadata {
        name: name.to_string(),
        index,
        storage,
        events,
    })
}

fn resolve(
    types: &PortableRegistry,
    id: u32,
) -> std::result::Result<&scale_info::Type<PortableForm>, ChainError> {
    types
        .resolve(id)
        .ok_or_else(|| ChainError::Metadata(format!("type {id} missing from registry")))
}

/// Wire layout of registry type `id`. Single-field wrappers collapse into
/// their field since they encode identically.
fn layout(
    types: &PortableRegistry,
    id: u32,
    depth: usize,
) -> std::result::Result<FieldType, ChainError> {
    if depth > MAX_TYPE_DEPTH {
        return Err(ChainError::Metadata(format!("type {id} nests too deeply")));
    }
    let next = depth + 1;
    Ok(match &resolve(types, id)?.type_def {
        TypeDef::Composite(c) => composite(types, c.fields.iter().map(|f| f.ty.id), next)?,
        TypeDef::Tuple(t) => composite(types, t.fields.iter().map(|f| f.id), next)?,
        TypeDef::Variant(v) => FieldType::Variant {
            variants: v
                .variants
                .iter()
                .map(|var| {
                    Ok(VariantLayout {
                        index: var.index,
                        fields: var
                            .fields
                            .iter()
                            .map(|f| layout(types, f.ty.id, next))
                            .collect::<std::result::Result<_, ChainError>>()?,
                    })
                })
                .collect::<std::result::Result<_, ChainError>>()?,
        },
        TypeDef::Sequence(s) => FieldType::Sequence {
            item: Box::new(layout(types, s.type_param.id, next)?),
        },
        TypeDef::Array(a) => FieldType::Array {
            len: a.len as usize,
            item: Box::new(layout(types, a.type_param.id, next)?),
        },
        TypeDef::Primitive(p) => primitive(p),
        TypeDef::Compact(_) => FieldType::Compact,
        TypeDef::BitSequence(b) => FieldType::BitSequence {
            store_bytes: match &resolve(types, b.bit_store_type.id)?.type_def {
                TypeDef::Primitive(TypeDefPrimitive::U8) => 1,
                TypeDef::Primitive(TypeDefPrimitive::U16) => 2,
                TypeDef::Primitive(TypeDefPrimitive::U32) => 4,
                TypeDef::Primitive(TypeDefPrimitive::U64) => 8,
                _ => {
                    return Err(ChainError::Metadata(format!(
                        "unsupported bit store type for type {id}"
                    )))
                }
            },
        },
    })
}

fn composite(
    types: &PortableRegistry,
    ids: impl Iterator<Item = u32>,
    depth: usize,
) -> std::result::Result<FieldType, ChainError> {
    let mut fields = ids
        .map(|id| layout(types, id, depth))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(if fields.len() == 1 {
        fields.remove(0)
    } else {
        FieldType::Composite { fields }
    })
}

/// Signed integers share the width of their unsigned counterpart.
fn primitive(p: &TypeDefPrimitive) -> FieldType {
    match p {
        TypeDefPrimitive::Bool => FieldType::Bool,
        TypeDefPrimitive::Char => FieldType::U32,
        TypeDefPrimitive::Str => FieldType::Bytes,
        TypeDefPrimitive::U8 | TypeDefPrimitive::I8 => FieldType::U8,
        TypeDefPrimitive::U16 | TypeDefPrimitive::I16 => FieldType::U16,
        TypeDefPrimitive::U32 | TypeDefPrimitive::I32 => FieldType::U32,
        TypeDefPrimitive::U64 | TypeDefPrimitive::I64 => FieldType::U64,
        TypeDefPrimitive::U128 | TypeDefPrimitive::I128 => FieldType::U128,
        TypeDefPrimitive::U256 | TypeDefPrimitive::I256 => FieldType::Array {
            len: 32,
            item: Box::new(FieldType::U8),
        },
    }
}

fn twox128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&xxh64(data, 0).to_le_bytes());
    out[8..].copy_from_slice(&xxh64(data, 1).to_le_bytes());
    out
}

/// Raw storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(pub Vec<u8>);

impl StorageKey {
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        hex::decode(s.trim_start_matches("0x")).map(StorageKey)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}
