//! Item codec plug-in.
//!
//! Trees may encode keys and values on their way to disk, for example with a
//! Huffman coder. Encoding happens during reconciliation; decoding happens
//! when an on-page item is first needed.

use crate::storage::error::StorageResult;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

pub trait ItemCodec: Send + Sync + fmt::Debug {
    fn encode(&self, data: &[u8]) -> StorageResult<Bytes>;
    fn decode(&self, data: &[u8]) -> StorageResult<Bytes>;
}

/// Optional codecs for a tree's keys and values.
#[derive(Debug, Clone, Default)]
pub struct Codecs {
    pub key: Option<Arc<dyn ItemCodec>>,
    pub value: Option<Arc<dyn ItemCodec>>,
}

impl Codecs {
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn encode_key(&self, key: &Bytes) -> StorageResult<Bytes> {
        match &self.key {
            Some(codec) => codec.encode(key),
            None => Ok(key.clone()),
        }
    }

    pub(crate) fn decode_key(&self, key: &Bytes) -> StorageResult<Bytes> {
        match &self.key {
            Some(codec) => codec.decode(key),
            None => Ok(key.clone()),
        }
    }

    pub(crate) fn encode_value(&self, value: &Bytes) -> StorageResult<Bytes> {
        match &self.value {
            Some(codec) => codec.encode(value),
            None => Ok(value.clone()),
        }
    }

    pub(crate) fn decode_value(&self, value: &Bytes) -> StorageResult<Bytes> {
        match &self.value {
            Some(codec) => codec.decode(value),
            None => Ok(value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Reverse;

    impl ItemCodec for Reverse {
        fn encode(&self, data: &[u8]) -> StorageResult<Bytes> {
            Ok(data.iter().rev().copied().collect::<Vec<_>>().into())
        }

        fn decode(&self, data: &[u8]) -> StorageResult<Bytes> {
            self.encode(data)
        }
    }

    #[test]
    fn test_codecs_apply_per_item_kind() {
        let codecs = Codecs {
            key: Some(Arc::new(Reverse)),
            value: None,
        };
        let item = Bytes::from_static(b"abc");
        assert_eq!(codecs.encode_key(&item).unwrap().as_ref(), b"cba");
        assert_eq!(codecs.encode_value(&item).unwrap().as_ref(), b"abc");
        let round = codecs.decode_key(&codecs.encode_key(&item).unwrap()).unwrap();
        assert_eq!(round, item);
    }
}
