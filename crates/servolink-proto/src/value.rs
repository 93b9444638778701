use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// String-keyed mapping used everywhere a wire value carries sub-fields.
pub type ValueMap = BTreeMap<String, Value>;

/// Self-describing wire value.
///
/// `UInt` is only produced for magnitudes above `i64::MAX`; every smaller
/// integer normalizes to `Int` so that `decode(encode(v)) == v` holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(ValueMap),
    NdArray(NdArray),
    Modality(ModalityConfig),
}

impl Value {
    pub fn map() -> ValueMap {
        ValueMap::new()
    }

    pub fn from_u64(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(signed) => Value::Int(signed),
            Err(_) => Value::UInt(value),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric view over `Int`, `UInt` and `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::UInt(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::UInt(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::NdArray(array) => Some(array),
            _ => None,
        }
    }

    pub fn is_numeric_scalar(&self) -> bool {
        matches!(self, Value::Int(_) | Value::UInt(_) | Value::Float(_))
    }

    /// Looks up a dotted path, greedily matching multi-segment keys the way
    /// camera paths like `robot.cameras.front` are resolved: if a segment is
    /// missing, the remainder of the path is tried as one literal key before
    /// giving up.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let parts: Vec<&str> = path.split('.').collect();
        let mut current = self;
        let mut index = 0;
        while index < parts.len() {
            let map = current.as_map()?;
            if let Some(next) = map.get(parts[index]) {
                current = next;
                index += 1;
                continue;
            }
            let remaining = parts[index..].join(".");
            if let Some(found) = map.get(&remaining) {
                return Some(found);
            }
            return None;
        }
        Some(current)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<NdArray> for Value {
    fn from(value: NdArray) -> Self {
        Value::NdArray(value)
    }
}

/// Element type of a dense numeric array, named by its NPY descr string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F16,
    F32,
    F64,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl Dtype {
    pub fn descr(self) -> &'static str {
        match self {
            Dtype::F16 => "<f2",
            Dtype::F32 => "<f4",
            Dtype::F64 => "<f8",
            Dtype::U8 => "|u1",
            Dtype::U16 => "<u2",
            Dtype::U32 => "<u4",
            Dtype::U64 => "<u8",
            Dtype::I8 => "|i1",
            Dtype::I16 => "<i2",
            Dtype::I32 => "<i4",
            Dtype::I64 => "<i8",
        }
    }

    pub fn from_descr(descr: &str) -> Result<Self, ProtoError> {
        let normalized = descr.trim_start_matches(['<', '|', '=']);
        match normalized {
            "f2" => Ok(Dtype::F16),
            "f4" => Ok(Dtype::F32),
            "f8" => Ok(Dtype::F64),
            "u1" => Ok(Dtype::U8),
            "u2" => Ok(Dtype::U16),
            "u4" => Ok(Dtype::U32),
            "u8" => Ok(Dtype::U64),
            "i1" => Ok(Dtype::I8),
            "i2" => Ok(Dtype::I16),
            "i4" => Ok(Dtype::I32),
            "i8" => Ok(Dtype::I64),
            other => {
                Err(ProtoError::BadArray(format!("unsupported dtype {other}")))
            }
        }
    }

    pub fn itemsize(self) -> usize {
        match self {
            Dtype::U8 | Dtype::I8 => 1,
            Dtype::F16 | Dtype::U16 | Dtype::I16 => 2,
            Dtype::F32 | Dtype::U32 | Dtype::I32 => 4,
            Dtype::F64 | Dtype::U64 | Dtype::I64 => 8,
        }
    }
}

/// Dense n-dimensional numeric array: dtype, shape and row-major
/// little-endian bytes. The wire form is a self-contained NPY blob.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    pub fn new(
        dtype: Dtype,
        shape: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<Self, ProtoError> {
        let count: usize = shape.iter().product();
        let expected = count.saturating_mul(dtype.itemsize());
        if data.len() != expected {
            return Err(ProtoError::BadArray(format!(
                "data length {} does not match dtype {} shape {:?}",
                data.len(),
                dtype.descr(),
                shape
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, ProtoError> {
        let mut data = Vec::with_capacity(values.len() * 4);
        for value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(Dtype::F32, shape, data)
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, ProtoError> {
        let mut data = Vec::with_capacity(values.len() * 8);
        for value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(Dtype::F64, shape, data)
    }

    pub fn from_u8(shape: Vec<usize>, values: Vec<u8>) -> Result<Self, ProtoError> {
        Self::new(Dtype::U8, shape, values)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Widens every element to f64, in row-major order.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let count = self.element_count();
        let mut out = Vec::with_capacity(count);
        let size = self.dtype.itemsize();
        for index in 0..count {
            let chunk = &self.data[index * size..(index + 1) * size];
            out.push(read_element_f64(self.dtype, chunk));
        }
        out
    }

    /// Row `index` of a rank-1 or rank-2 array as f64 values. For rank-1
    /// arrays only row 0 exists and yields the whole vector.
    pub fn row_f64(&self, index: usize) -> Option<Vec<f64>> {
        match self.shape.len() {
            1 => {
                if index == 0 {
                    Some(self.to_f64_vec())
                } else {
                    None
                }
            }
            2 => {
                let rows = self.shape[0];
                let cols = self.shape[1];
                if index >= rows {
                    return None;
                }
                let size = self.dtype.itemsize();
                let start = index * cols * size;
                let mut out = Vec::with_capacity(cols);
                for col in 0..cols {
                    let at = start + col * size;
                    out.push(read_element_f64(self.dtype, &self.data[at..at + size]));
                }
                Some(out)
            }
            _ => None,
        }
    }
}

fn read_element_f64(dtype: Dtype, chunk: &[u8]) -> f64 {
    match dtype {
        Dtype::F16 => f16_bits_to_f64(u16::from_le_bytes([chunk[0], chunk[1]])),
        Dtype::F32 => {
            f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
        }
        Dtype::F64 => f64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5],
            chunk[6], chunk[7],
        ]),
        Dtype::U8 => chunk[0] as f64,
        Dtype::U16 => u16::from_le_bytes([chunk[0], chunk[1]]) as f64,
        Dtype::U32 => {
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
        }
        Dtype::U64 => u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5],
            chunk[6], chunk[7],
        ]) as f64,
        Dtype::I8 => chunk[0] as i8 as f64,
        Dtype::I16 => i16::from_le_bytes([chunk[0], chunk[1]]) as f64,
        Dtype::I32 => {
            i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
        }
        Dtype::I64 => i64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5],
            chunk[6], chunk[7],
        ]) as f64,
    }
}

/// IEEE 754 half-precision to f64 widening. Arrays only pass f16 through
/// verbatim, so this is needed solely for numeric views.
fn f16_bits_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x3ff) as f64;
    match exponent {
        0 => sign * mantissa * 2f64.powi(-24),
        0x1f => {
            if mantissa == 0.0 {
                sign * f64::INFINITY
            } else {
                f64::NAN
            }
        }
        _ => sign * (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    }
}

/// Modality configuration shipped as the `__modality_config__` extension:
/// a JSON body with delta indices and modality keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityConfig {
    #[serde(default)]
    pub delta_indices: Vec<i64>,
    #[serde(default)]
    pub modality_keys: Vec<String>,
}

impl ModalityConfig {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self)
            .map_err(|err| ProtoError::Encode(err.to_string()))
    }

    pub fn from_json(payload: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(payload)
            .map_err(|err| ProtoError::Decode(err.to_string()))
    }
}
