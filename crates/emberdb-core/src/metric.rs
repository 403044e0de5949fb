//! The metric point model and its wire codec.
//!
//! A [`MetricList`] is the unit the broker appends to a shard's replication
//! queue and the unit the storage side decodes before writing into the
//! in-memory database. The encoding is hand-rolled over varints rather than
//! a serde format: payloads sit in append-only logs for a long time, so the
//! byte layout is part of the system contract and must not drift with a
//! serialization library.
//!
//! Layout (all integers varint, strings length-prefixed UTF-8):
//!
//! ```text
//! MetricList := database count Metric*
//! Metric     := name timestamp(zigzag) tag_count (key value)* field_count Field*
//! Field      := name kind(u8) payload
//! payload    := f64(BE)                      for scalar kinds
//!             | bucket_count f64(BE)*        for histograms
//! ```
//!
//! Tags are kept in a `BTreeMap` so a metric has exactly one canonical byte
//! representation; the shard router hashes the sorted pairs.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::field::{FieldType, FieldValue};
use crate::varint;

/// A batch of metric points bound for one database.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricList {
    pub database: String,
    pub metrics: Vec<Metric>,
}

/// One metric point: a named measurement at a timestamp with a tag
/// combination and one or more fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub tags: BTreeMap<String, String>,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

impl MetricList {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        varint::encode_str(&mut buf, &self.database);
        varint::encode_u64(&mut buf, self.metrics.len() as u64);
        for metric in &self.metrics {
            metric.encode_into(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Result<MetricList> {
        let database = varint::decode_str(buf)?;
        let count = varint::decode_u64(buf)? as usize;
        let mut metrics = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            metrics.push(Metric::decode(buf)?);
        }
        Ok(MetricList { database, metrics })
    }
}

impl Metric {
    fn encode_into(&self, buf: &mut BytesMut) {
        varint::encode_str(buf, &self.name);
        varint::encode_i64(buf, self.timestamp);
        varint::encode_u64(buf, self.tags.len() as u64);
        for (key, value) in &self.tags {
            varint::encode_str(buf, key);
            varint::encode_str(buf, value);
        }
        varint::encode_u64(buf, self.fields.len() as u64);
        for field in &self.fields {
            varint::encode_str(buf, &field.name);
            buf.put_u8(field.value.field_type() as u8);
            match &field.value {
                FieldValue::Sum(v)
                | FieldValue::Min(v)
                | FieldValue::Max(v)
                | FieldValue::First(v)
                | FieldValue::Last(v) => buf.put_f64(*v),
                FieldValue::Histogram(buckets) => {
                    varint::encode_u64(buf, buckets.len() as u64);
                    for bucket in buckets {
                        buf.put_f64(*bucket);
                    }
                }
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Metric> {
        let name = varint::decode_str(buf)?;
        let timestamp = varint::decode_i64(buf)?;
        let tag_count = varint::decode_u64(buf)? as usize;
        let mut tags = BTreeMap::new();
        for _ in 0..tag_count {
            let key = varint::decode_str(buf)?;
            let value = varint::decode_str(buf)?;
            tags.insert(key, value);
        }
        let field_count = varint::decode_u64(buf)? as usize;
        let mut fields = Vec::with_capacity(field_count.min(64));
        for _ in 0..field_count {
            fields.push(Self::decode_field(buf)?);
        }
        Ok(Metric {
            name,
            timestamp,
            tags,
            fields,
        })
    }

    fn decode_field(buf: &mut impl Buf) -> Result<Field> {
        let name = varint::decode_str(buf)?;
        if !buf.has_remaining() {
            return Err(Error::UnexpectedEof);
        }
        let kind = buf.get_u8();
        let field_type = FieldType::from_u8(kind).ok_or(Error::UnknownFieldKind(kind))?;
        let value = if field_type.is_scalar() {
            if buf.remaining() < 8 {
                return Err(Error::UnexpectedEof);
            }
            let v = buf.get_f64();
            match field_type {
                FieldType::Sum => FieldValue::Sum(v),
                FieldType::Min => FieldValue::Min(v),
                FieldType::Max => FieldValue::Max(v),
                FieldType::First => FieldValue::First(v),
                FieldType::Last => FieldValue::Last(v),
                FieldType::Histogram => unreachable!(),
            }
        } else {
            let count = varint::decode_u64(buf)? as usize;
            if buf.remaining() < count * 8 {
                return Err(Error::UnexpectedEof);
            }
            let mut buckets = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                buckets.push(buf.get_f64());
            }
            FieldValue::Histogram(buckets)
        };
        Ok(Field { name, value })
    }

    /// A stable byte signature of the tag combination, used for series
    /// identity and shard routing. Tags iterate in key order, so equal tag
    /// sets produce equal signatures regardless of insertion order.
    pub fn tag_signature(&self) -> Vec<u8> {
        let mut sig = Vec::new();
        for (key, value) in &self.tags {
            sig.extend_from_slice(key.as_bytes());
            sig.push(b'=');
            sig.extend_from_slice(value.as_bytes());
            sig.push(b',');
        }
        sig
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metric() -> Metric {
        Metric {
            name: "cpu".to_string(),
            timestamp: 1_700_000_000_000,
            tags: BTreeMap::from([
                ("host".to_string(), "1.1.1.1".to_string()),
                ("disk".to_string(), "/tmp".to_string()),
            ]),
            fields: vec![
                Field {
                    name: "f1".to_string(),
                    value: FieldValue::Sum(1.0),
                },
                Field {
                    name: "lat".to_string(),
                    value: FieldValue::Histogram(vec![0.5, 0.9, 0.99]),
                },
            ],
        }
    }

    #[test]
    fn test_metric_list_round_trip() {
        let list = MetricList {
            database: "db".to_string(),
            metrics: vec![sample_metric()],
        };
        let encoded = list.encode();
        let decoded = MetricList::decode(&mut encoded.as_ref()).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn test_empty_list_round_trip() {
        let list = MetricList {
            database: "db".to_string(),
            metrics: vec![],
        };
        let decoded = MetricList::decode(&mut list.encode().as_ref()).unwrap();
        assert!(decoded.metrics.is_empty());
        assert_eq!(decoded.database, "db");
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let encoded = MetricList {
            database: "db".to_string(),
            metrics: vec![sample_metric()],
        }
        .encode();
        for cut in [1, encoded.len() / 2, encoded.len() - 1] {
            let truncated = &encoded[..cut];
            assert!(MetricList::decode(&mut &*truncated).is_err());
        }
    }

    #[test]
    fn test_unknown_field_kind_is_an_error() {
        let mut buf = BytesMut::new();
        varint::encode_str(&mut buf, "f");
        buf.put_u8(99);
        assert_eq!(
            Metric::decode_field(&mut buf.as_ref()),
            Err(Error::UnknownFieldKind(99))
        );
    }

    #[test]
    fn test_tag_signature_is_insertion_order_independent() {
        let mut a = sample_metric();
        a.tags = BTreeMap::new();
        a.tags.insert("b".to_string(), "2".to_string());
        a.tags.insert("a".to_string(), "1".to_string());

        let mut b = sample_metric();
        b.tags = BTreeMap::new();
        b.tags.insert("a".to_string(), "1".to_string());
        b.tags.insert("b".to_string(), "2".to_string());

        assert_eq!(a.tag_signature(), b.tag_signature());
        assert_eq!(a.tag_signature(), b"a=1,b=2,".to_vec());
    }
}
