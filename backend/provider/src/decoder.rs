//! Decodes the raw value of `System.Events` into order events.
//!
//! The storage value is a SCALE `Vec<EventRecord>` where every record is
//! `(phase, event, topics)` and `event` is `(pallet index, event index,
//! fields...)`. The field layout of every event comes from
//! [`ChainMetadata`]; events outside `ResourceOrder`'s three order events are
//! decoded only so they can be skipped.

use crate::errors::{DecodeError, ScaleError};
use crate::events::{
    DecodedOrderEvent, CREATE_ORDER_SUCCESS, RENEW_ORDER_SUCCESS, RESOURCE_ORDER_PALLET,
    WITHDRAW_LOCKED_ORDER_PRICE_SUCCESS,
};
use crate::metadata::{ChainMetadata, FieldType};

type ScaleResult<T> = std::result::Result<T, ScaleError>;

/// Decode one `System.Events` value, keeping only the order events in the
/// order they appear in the block.
pub fn decode_order_events(
    data: &[u8],
    metadata: &ChainMetadata,
) -> Result<Vec<DecodedOrderEvent>, DecodeError> {
    let mut input = Input::new(data);
    let count = input.compact().map_err(DecodeError::Records)?;
    let mut events = Vec::new();

    for _ in 0..count {
        decode_phase(&mut input).map_err(DecodeError::Records)?;
        let pallet_index = input.u8().map_err(DecodeError::Records)?;
        let event_index = input.u8().map_err(DecodeError::Records)?;
        let (pallet, event) = metadata.event(pallet_index, event_index).ok_or(
            DecodeError::Records(ScaleError::UnknownEvent {
                pallet: pallet_index,
                event: event_index,
            }),
        )?;

        let kind = format!("{}.{}", pallet.name, event.name);
        let mut fields = Vec::with_capacity(event.fields.len());
        for field in &event.fields {
            let value = decode_value(&mut input, &field.ty).map_err(|cause| DecodeError::Event {
                kind: kind.clone(),
                cause,
            })?;
            fields.push((field.name.as_str(), value));
        }

        let topics = input.compact().map_err(DecodeError::Records)?;
        let topic_bytes = usize::try_from(topics)
            .ok()
            .and_then(|n| n.checked_mul(32))
            .ok_or(DecodeError::Records(ScaleError::Overflow("usize")))?;
        input.take(topic_bytes).map_err(DecodeError::Records)?;

        if pallet.name == RESOURCE_ORDER_PALLET {
            if let Some(ev) = to_order_event(&event.name, &fields)
                .map_err(|cause| DecodeError::Event { kind, cause })?
            {
                events.push(ev);
            }
        }
    }

    if input.remaining() > 0 {
        return Err(DecodeError::Records(ScaleError::TrailingBytes(
            input.remaining(),
        )));
    }
    Ok(events)
}

fn to_order_event(
    name: &str,
    fields: &[(&str, Value)],
) -> ScaleResult<Option<DecodedOrderEvent>> {
    let event = match name {
        CREATE_ORDER_SUCCESS => DecodedOrderEvent::Created {
            resource_index: field_u64(fields, "resource_index")?,
            order_index: field_u64(fields, "order_index")?,
            account: hex::encode(field_bytes(fields, "account_id")?),
            duration: field_u32(fields, "duration")?,
            public_key: String::from_utf8_lossy(field_bytes(fields, "public_key")?).into_owned(),
        },
        RENEW_ORDER_SUCCESS => DecodedOrderEvent::Renewed {
            resource_index: field_u64(fields, "resource_index")?,
            order_index: field_u64(fields, "order_index")?,
            duration: field_u32(fields, "duration")?,
        },
        WITHDRAW_LOCKED_ORDER_PRICE_SUCCESS => DecodedOrderEvent::Cancelled {
            resource_index: match find(fields, "resource_index") {
                Some(Value::Uint(_)) => Some(field_u64(fields, "resource_index")?),
                _ => None,
            },
            order_index: field_u64(fields, "order_index")?,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

// ─────────────────────────────────────────────────────────
// Field access
// ─────────────────────────────────────────────────────────

fn find<'a>(fields: &'a [(&str, Value)], name: &str) -> Option<&'a Value> {
    fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
}

fn field_u64(fields: &[(&str, Value)], name: &str) -> ScaleResult<u64> {
    match find(fields, name) {
        Some(Value::Uint(n)) => u64::try_from(*n).map_err(|_| ScaleError::Overflow("u64")),
        _ => Err(ScaleError::MissingField(name.to_string())),
    }
}

fn field_u32(fields: &[(&str, Value)], name: &str) -> ScaleResult<u32> {
    match find(fields, name) {
        Some(Value::Uint(n)) => u32::try_from(*n).map_err(|_| ScaleError::Overflow("u32")),
        _ => Err(ScaleError::MissingField(name.to_string())),
    }
}

fn field_bytes<'a>(fields: &'a [(&str, Value)], name: &str) -> ScaleResult<&'a [u8]> {
    match find(fields, name) {
        Some(Value::Bytes(b)) => Ok(b),
        _ => Err(ScaleError::MissingField(name.to_string())),
    }
}

// ─────────────────────────────────────────────────────────
// SCALE primitives
// ─────────────────────────────────────────────────────────

/// A decoded field value, just detailed enough to pull order data out.
/// Anything that is neither an integer nor a byte string is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Uint(u128),
    Bytes(Vec<u8>),
    Skipped,
}

fn decode_phase(input: &mut Input<'_>) -> ScaleResult<()> {
    match input.u8()? {
        0 => input.take(4).map(|_| ()),
        1 | 2 => Ok(()),
        tag => Err(ScaleError::InvalidPhase(tag)),
    }
}

fn decode_value(input: &mut Input<'_>, ty: &FieldType) -> ScaleResult<Value> {
    Ok(match ty {
        FieldType::Bool => match input.u8()? {
            0 | 1 => Value::Skipped,
            index => return Err(ScaleError::InvalidVariant { index }),
        },
        FieldType::U8 => Value::Uint(input.u8()?.into()),
        FieldType::U16 => Value::Uint(input.uint(2)?),
        FieldType::U32 => Value::Uint(input.uint(4)?),
        FieldType::U64 => Value::Uint(input.uint(8)?),
        FieldType::U128 => Value::Uint(input.uint(16)?),
        FieldType::Compact => Value::Uint(input.compact()?),
        FieldType::AccountId | FieldType::H256 => Value::Bytes(input.take(32)?.to_vec()),
        FieldType::Bytes => {
            let len = input.length()?;
            Value::Bytes(input.take(len)?.to_vec())
        }
        FieldType::Array { len, item } => decode_seq(input, *len, item)?,
        FieldType::Sequence { item } => {
            let len = input.length()?;
            decode_seq(input, len, item)?
        }
        FieldType::Optional { item } => match input.u8()? {
            0 => Value::Skipped,
            1 => decode_value(input, item)?,
            index => return Err(ScaleError::InvalidVariant { index }),
        },
        FieldType::Composite { fields } => {
            for f in fields {
                decode_value(input, f)?;
            }
            Value::Skipped
        }
        FieldType::Variant { variants } => {
            let index = input.u8()?;
            let variant = variants
                .iter()
                .find(|v| v.index == index)
                .ok_or(ScaleError::InvalidVariant { index })?;
            for f in &variant.fields {
                decode_value(input, f)?;
            }
            Value::Skipped
        }
        FieldType::BitSequence { store_bytes } => {
            let bits = input.length()?;
            let word_bits = store_bytes
                .checked_mul(8)
                .filter(|w| *w > 0)
                .ok_or(ScaleError::Overflow("usize"))?;
            let len = bits
                .div_ceil(word_bits)
                .checked_mul(*store_bytes)
                .ok_or(ScaleError::Overflow("usize"))?;
            input.take(len)?;
            Value::Skipped
        }
    })
}

fn decode_seq(input: &mut Input<'_>, len: usize, item: &FieldType) -> ScaleResult<Value> {
    if *item == FieldType::U8 {
        return Ok(Value::Bytes(input.take(len)?.to_vec()));
    }
    for _ in 0..len {
        decode_value(input, item)?;
    }
    Ok(Value::Skipped)
}

struct Input<'a> {
    data: &'a [u8],
}

impl<'a> Input<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, n: usize) -> ScaleResult<&'a [u8]> {
        if n > self.data.len() {
            return Err(ScaleError::UnexpectedEof {
                needed: n,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> ScaleResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Little-endian unsigned integer of `width` bytes (at most 16).
    fn uint(&mut self, width: usize) -> ScaleResult<u128> {
        let bytes = self.take(width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
    }

    fn compact(&mut self) -> ScaleResult<u128> {
        let first = self.u8()?;
        match first & 0b11 {
            0 => Ok(u128::from(first >> 2)),
            1 => {
                let rest = self.u8()?;
                Ok(((u128::from(rest) << 8) | u128::from(first)) >> 2)
            }
            2 => {
                let rest = self.uint(3)?;
                Ok(((rest << 8) | u128::from(first)) >> 2)
            }
            _ => {
                let len = usize::from(first >> 2) + 4;
                if len > 16 {
                    return Err(ScaleError::InvalidCompact);
                }
                self.uint(len)
            }
        }
    }

    fn length(&mut self) -> ScaleResult<usize> {
        usize::try_from(self.compact()?).map_err(|_| ScaleError::Overflow("usize"))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn compact(n: u64) -> Vec<u8> {
        if n < 1 << 6 {
            vec![(n as u8) << 2]
        } else if n < 1 << 14 {
            (((n as u16) << 2) | 1).to_le_bytes().to_vec()
        } else if n < 1 << 30 {
            (((n as u32) << 2) | 2).to_le_bytes().to_vec()
        } else {
            let bytes = n.to_le_bytes();
            let len = 8 - (n.leading_zeros() as usize / 8);
            let mut out = vec![(((len - 4) as u8) << 2) | 3];
            out.extend_from_slice(&bytes[..len]);
            out
        }
    }

    fn bytes(b: &[u8]) -> Vec<u8> {
        let mut out = compact(b.len() as u64);
        out.extend_from_slice(b);
        out
    }

    fn record(pallet: u8, event: u8, body: Vec<u8>) -> Vec<u8> {
        let mut out = vec![0u8];
        out.extend_from_slice(&1u32.to_le_bytes());
        out.push(pallet);
        out.push(event);
        out.extend(body);
        out.extend(compact(0));
        out
    }

    fn extrinsic_success() -> Vec<u8> {
        let mut body = compact(125_000_000);
        body.extend(compact(3_593));
        body.push(0);
        body.push(0);
        record(0, 0, body)
    }

    pub(crate) fn create_order(order: u64, resource: u64, key: &str) -> Vec<u8> {
        let mut body = vec![7u8; 32];
        body.extend(order.to_le_bytes());
        body.extend(resource.to_le_bytes());
        body.extend(10u32.to_le_bytes());
        body.extend(bytes(key.as_bytes()));
        record(9, 0, body)
    }

    fn renew_order(order: u64, resource: u64) -> Vec<u8> {
        let mut body = vec![7u8; 32];
        body.extend(order.to_le_bytes());
        body.extend(resource.to_le_bytes());
        body.extend(5u32.to_le_bytes());
        record(9, 2, body)
    }

    pub(crate) fn cancel_order(order: u64) -> Vec<u8> {
        let mut body = vec![7u8; 32];
        body.extend(order.to_le_bytes());
        body.extend(1_000u128.to_le_bytes());
        record(9, 3, body)
    }

    pub(crate) fn events(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = compact(records.len() as u64);
        for r in records {
            out.extend_from_slice(r);
        }
        out
    }

    fn meta() -> ChainMetadata {
        ChainMetadata::bundled().unwrap()
    }

    #[test]
    fn compact_modes() {
        for n in [0u64, 1, 63, 64, 16_383, 16_384, (1 << 30) - 1, 1 << 30, u64::MAX] {
            let enc = compact(n);
            let mut input = Input::new(&enc);
            assert_eq!(input.compact().unwrap(), u128::from(n), "n={n}");
            assert_eq!(input.remaining(), 0);
        }
    }

    #[test]
    fn decodes_create_order_between_system_events() {
        let raw = events(&[
            extrinsic_success(),
            create_order(42, 7, "ssh-ed25519 AAAA"),
            extrinsic_success(),
        ]);
        let decoded = decode_order_events(&raw, &meta()).unwrap();
        assert_eq!(
            decoded,
            vec![DecodedOrderEvent::Created {
                resource_index: 7,
                order_index: 42,
                account: hex::encode([7u8; 32]),
                duration: 10,
                public_key: "ssh-ed25519 AAAA".to_string(),
            }]
        );
    }

    #[test]
    fn keeps_block_order() {
        let raw = events(&[cancel_order(1), create_order(2, 7, "k"), renew_order(2, 7)]);
        let decoded = decode_order_events(&raw, &meta()).unwrap();
        let names: Vec<_> = decoded.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "WithdrawLockedOrderPriceSuccess",
                "CreateOrderSuccess",
                "ReNewOrderSuccess"
            ]
        );
        assert_eq!(
            decoded[0],
            DecodedOrderEvent::Cancelled {
                resource_index: None,
                order_index: 1
            }
        );
        assert_eq!(
            decoded[2],
            DecodedOrderEvent::Renewed {
                resource_index: 7,
                order_index: 2,
                duration: 5
            }
        );
    }

    #[test]
    fn skips_failed_extrinsic_with_module_error() {
        let mut body = vec![3u8, 9];
        body.extend([1, 0, 0, 0]);
        body.extend(compact(1_000));
        body.extend(compact(0));
        body.push(0);
        body.push(1);
        let raw = events(&[record(0, 1, body), cancel_order(5)]);
        let decoded = decode_order_events(&raw, &meta()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].order_index(), 5);
    }

    #[test]
    fn empty_block_has_no_events() {
        assert!(decode_order_events(&compact(0), &meta()).unwrap().is_empty());
    }

    #[test]
    fn unknown_event_fails_the_change_set() {
        let raw = events(&[record(42, 0, vec![])]);
        let err = decode_order_events(&raw, &meta()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Records(ScaleError::UnknownEvent { pallet: 42, event: 0 })
        );
    }

    #[test]
    fn truncated_event_names_its_kind() {
        let mut raw = events(&[create_order(42, 7, "key")]);
        raw.truncate(raw.len() - 6);
        match decode_order_events(&raw, &meta()).unwrap_err() {
            DecodeError::Event { kind, cause } => {
                assert_eq!(kind, "ResourceOrder.CreateOrderSuccess");
                assert!(matches!(cause, ScaleError::UnexpectedEof { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut raw = events(&[cancel_order(5)]);
        raw.push(0xff);
        assert_eq!(
            decode_order_events(&raw, &meta()).unwrap_err(),
            DecodeError::Records(ScaleError::TrailingBytes(1))
        );
    }

    #[test]
    fn order_event_survives_unlisted_pallet_in_the_same_block() {
        use crate::metadata::tests::{
            runtime_events, runtime_metadata, runtime_record, DispatchClass, MarketEvent,
            ResourceOrderEvent, SystemEvent,
        };

        let meta = ChainMetadata::from_runtime_metadata(&runtime_metadata(), 104).unwrap();
        let raw = runtime_events(&[
            runtime_record(
                0,
                SystemEvent::ExtrinsicSuccess {
                    weight: 1,
                    class: DispatchClass::Operational,
                },
            ),
            runtime_record(
                10,
                MarketEvent::Listed {
                    who: [1u8; 32],
                    tags: vec![(3, Some(-4)), (5, None)],
                    stake: 1u128 << 70,
                    note: "gpu".into(),
                },
            ),
            runtime_record(
                9,
                ResourceOrderEvent::CreateOrderSuccess([7u8; 32], 42, 7, 10, b"ssh-rsa K".to_vec()),
            ),
            runtime_record(9, ResourceOrderEvent::ReNewOrderSuccess([7u8; 32], 42, 7, 3)),
            runtime_record(
                9,
                ResourceOrderEvent::WithdrawLockedOrderPriceSuccess([7u8; 32], 42, 5),
            ),
            runtime_record(
                0,
                SystemEvent::ExtrinsicSuccess {
                    weight: 2,
                    class: DispatchClass::Normal,
                },
            ),
        ]);

        let decoded = decode_order_events(&raw, &meta).unwrap();
        assert_eq!(
            decoded,
            vec![
                DecodedOrderEvent::Created {
                    resource_index: 7,
                    order_index: 42,
                    account: hex::encode([7u8; 32]),
                    duration: 10,
                    public_key: "ssh-rsa K".to_string(),
                },
                DecodedOrderEvent::Renewed {
                    resource_index: 7,
                    order_index: 42,
                    duration: 3,
                },
                DecodedOrderEvent::Cancelled {
                    resource_index: None,
                    order_index: 42,
                },
            ]
        );
    }

    #[test]
    fn variants_are_matched_by_declared_index() {
        let mut meta = meta();
        meta.pallets.push(serde_json::from_value(serde_json::json!({
            "name": "Flags",
            "index": 30,
            "events": [{
                "name": "Set",
                "index": 0,
                "fields": [
                    {"name": "kind", "type": "variant", "variants": [
                        {"index": 4, "fields": [{"type": "u16"}]},
                        {"index": 9, "fields": []}
                    ]},
                    {"name": "bits", "type": "bit_sequence", "store_bytes": 4}
                ]
            }]
        }))
        .unwrap());

        let mut body = vec![4u8, 1, 0];
        body.extend(compact(33));
        body.extend([0u8; 8]);
        let raw = events(&[record(30, 0, body), cancel_order(8)]);
        let decoded = decode_order_events(&raw, &meta).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].order_index(), 8);

        let raw = events(&[record(30, 0, vec![1u8, 1, 0])]);
        assert!(matches!(
            decode_order_events(&raw, &meta).unwrap_err(),
            DecodeError::Event {
                cause: ScaleError::InvalidVariant { index: 1 },
                ..
            }
        ));
    }

    #[test]
    fn schema_without_order_field_reports_missing_field() {
        let mut meta = meta();
        let pallet = meta
            .pallets
            .iter_mut()
            .find(|p| p.name == "ResourceOrder")
            .unwrap();
        let cancel = pallet.events.iter_mut().find(|e| e.index == 3).unwrap();
        cancel.fields[1].name = "order_id".to_string();

        let raw = events(&[cancel_order(5)]);
        assert_eq!(
            decode_order_events(&raw, &meta).unwrap_err(),
            DecodeError::Event {
                kind: "ResourceOrder.WithdrawLockedOrderPriceSuccess".to_string(),
                cause: ScaleError::MissingField("order_index".to_string()),
            }
        );
    }
}
