use crate::codec::NumberReader;

/// Combines a MERGE operand chain with an optional base value. Operands are
/// passed oldest first. A `None` return means the operator could not make
/// sense of its inputs and the read or compaction surfaces corruption.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &'static str;

    fn full_merge(
        &self,
        key: &[u8],
        existing_value: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>>;

    /// Collapses two adjacent operands into one; `None` leaves them apart.
    fn partial_merge(&self, key: &[u8], left: &[u8], right: &[u8]) -> Option<Vec<u8>>;

    fn partial_merge_multi(&self, key: &[u8], operands: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut iter = operands.iter();
        let mut acc = iter.next()?.clone();
        for op in iter {
            acc = self.partial_merge(key, &acc, op)?;
        }
        Some(acc)
    }
}

/// Appends operands behind the existing value, separated by a byte.
pub struct StringAppendOperator {
    separator: u8,
}

impl StringAppendOperator {
    pub fn new(separator: u8) -> Self {
        StringAppendOperator { separator }
    }
}

impl MergeOperator for StringAppendOperator {
    fn name(&self) -> &'static str {
        "stratadb.StringAppendOperator"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        existing_value: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        let mut result = Vec::new();
        if let Some(v) = existing_value {
            result.extend_from_slice(v);
        }
        for op in operands {
            if !result.is_empty() {
                result.push(self.separator);
            }
            result.extend_from_slice(op);
        }
        Some(result)
    }

    fn partial_merge(&self, _key: &[u8], left: &[u8], right: &[u8]) -> Option<Vec<u8>> {
        let mut result = Vec::with_capacity(left.len() + right.len() + 1);
        result.extend_from_slice(left);
        result.push(self.separator);
        result.extend_from_slice(right);
        Some(result)
    }
}

/// Treats values and operands as little-endian u64 counters.
pub struct U64AddOperator {}

impl U64AddOperator {
    fn decode(data: &[u8]) -> Option<u64> {
        if data.len() != 8 {
            return None;
        }
        let mut buf = data;
        buf.read_u64_le().ok()
    }
}

impl MergeOperator for U64AddOperator {
    fn name(&self) -> &'static str {
        "stratadb.U64AddOperator"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        existing_value: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        let mut total = match existing_value {
            Some(v) => Self::decode(v)?,
            None => 0,
        };
        for op in operands {
            total = total.wrapping_add(Self::decode(op)?);
        }
        Some(total.to_le_bytes().to_vec())
    }

    fn partial_merge(&self, _key: &[u8], left: &[u8], right: &[u8]) -> Option<Vec<u8>> {
        let sum = Self::decode(left)?.wrapping_add(Self::decode(right)?);
        Some(sum.to_le_bytes().to_vec())
    }
}
