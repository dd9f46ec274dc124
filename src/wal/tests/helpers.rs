use crate::encoding::{Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError, WalRecord};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by the `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Dummy record modelling a memtable mutation, used to exercise WAL
/// round-trips of a record type with an `Option` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Encode for MutationRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MutationRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (seq, mut offset) = u64::decode_from(buf)?;
        let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = <Option<Vec<u8>>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { seq, key, value }, offset))
    }
}

pub fn mutation(seq: u64, key: &[u8], value: Option<&[u8]>) -> MutationRecord {
    MutationRecord {
        seq,
        key: key.to_vec(),
        value: value.map(<[u8]>::to_vec),
    }
}

pub fn collect_records<T: WalRecord>(wal: &Wal<T>) -> Result<Vec<T>, WalError> {
    wal.replay_iter()?.collect()
}
