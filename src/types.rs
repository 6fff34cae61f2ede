use crate::error::Error;

pub type SequenceNumber = u64;

/// Sequence numbers occupy the upper 56 bits of the 64-bit tag that trails
/// every internal key; the low 8 bits carry the value type.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
    Merge = 2,
}

/// When looking up a user key at some snapshot we seek to the internal key
/// with the largest tag visible at that snapshot. Tags order descending, so
/// the seek type is the numerically largest kind.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Merge;

impl TryFrom<u8> for ValueType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0u8 => Ok(ValueType::Deletion),
            1u8 => Ok(ValueType::Value),
            2u8 => Ok(ValueType::Merge),
            _ => Err(Error::Corruption("unknown value type tag".into())),
        }
    }
}
