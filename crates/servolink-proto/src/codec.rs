use rmp::Marker;

use crate::error::ProtoError;
use crate::npy::{decode_npy, encode_npy};
use crate::value::{ModalityConfig, Value, ValueMap};

/// Upper bound applied to inbound frames and embedded binary payloads.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

const NDARRAY_TAG: &str = "__ndarray__";
const NDARRAY_PAYLOAD: &str = "npy";
const MODALITY_TAG: &str = "__modality_config__";
const MODALITY_PAYLOAD: &str = "json";

const MAX_DEPTH: usize = 64;

/// Appends the MessagePack encoding of `value` to `buf`.
///
/// Numeric arrays and modality configs are written as their tagged-map
/// extension forms so any MessagePack peer can decode the envelope.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), ProtoError> {
    match value {
        Value::Nil => {
            rmp::encode::write_nil(buf).map_err(enc_err)?;
        }
        Value::Bool(flag) => {
            rmp::encode::write_bool(buf, *flag).map_err(enc_err)?;
        }
        Value::Int(number) => {
            rmp::encode::write_sint(buf, *number).map_err(enc_err)?;
        }
        Value::UInt(number) => {
            rmp::encode::write_uint(buf, *number).map_err(enc_err)?;
        }
        Value::Float(number) => {
            rmp::encode::write_f64(buf, *number).map_err(enc_err)?;
        }
        Value::Str(text) => {
            rmp::encode::write_str(buf, text).map_err(enc_err)?;
        }
        Value::Bytes(bytes) => {
            rmp::encode::write_bin(buf, bytes).map_err(enc_err)?;
        }
        Value::List(items) => {
            rmp::encode::write_array_len(buf, items.len() as u32)
                .map_err(enc_err)?;
            for item in items {
                encode_value(buf, item)?;
            }
        }
        Value::Map(map) => {
            rmp::encode::write_map_len(buf, map.len() as u32)
                .map_err(enc_err)?;
            for (key, entry) in map {
                rmp::encode::write_str(buf, key).map_err(enc_err)?;
                encode_value(buf, entry)?;
            }
        }
        Value::NdArray(array) => {
            rmp::encode::write_map_len(buf, 2).map_err(enc_err)?;
            rmp::encode::write_str(buf, NDARRAY_TAG).map_err(enc_err)?;
            rmp::encode::write_bool(buf, true).map_err(enc_err)?;
            rmp::encode::write_str(buf, NDARRAY_PAYLOAD).map_err(enc_err)?;
            rmp::encode::write_bin(buf, &encode_npy(array)).map_err(enc_err)?;
        }
        Value::Modality(config) => {
            rmp::encode::write_map_len(buf, 2).map_err(enc_err)?;
            rmp::encode::write_str(buf, MODALITY_TAG).map_err(enc_err)?;
            rmp::encode::write_bool(buf, true).map_err(enc_err)?;
            rmp::encode::write_str(buf, MODALITY_PAYLOAD).map_err(enc_err)?;
            rmp::encode::write_str(buf, &config.to_json()?).map_err(enc_err)?;
        }
    }
    Ok(())
}

/// Decodes one value from `bytes`, requiring the buffer to be fully
/// consumed. Binary payloads above `max_frame_bytes` fail as oversized.
pub fn decode_value(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<Value, ProtoError> {
    let mut reader = Reader { buf: bytes, pos: 0, max_frame_bytes };
    let value = reader.read_value(0)?;
    if reader.pos != bytes.len() {
        return Err(ProtoError::Decode(format!(
            "{} trailing bytes after value",
            bytes.len() - reader.pos
        )));
    }
    Ok(value)
}

fn enc_err<E: std::fmt::Display>(err: E) -> ProtoError {
    ProtoError::Encode(err.to_string())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    max_frame_bytes: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ProtoError> {
        if self.buf.len() - self.pos < len {
            return Err(ProtoError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn byte(&mut self, what: &'static str) -> Result<u8, ProtoError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtoError> {
        let raw = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ProtoError> {
        let raw = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ProtoError> {
        let raw = self.take(8, "u64")?;
        Ok(u64::from_be_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]))
    }

    fn checked_len(&self, len: usize) -> Result<usize, ProtoError> {
        if len > self.max_frame_bytes {
            return Err(ProtoError::Oversized(len));
        }
        Ok(len)
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, ProtoError> {
        if depth > MAX_DEPTH {
            return Err(ProtoError::Decode("value nesting too deep".to_string()));
        }

        let marker = Marker::from_u8(self.byte("marker")?);
        match marker {
            Marker::Null => Ok(Value::Nil),
            Marker::True => Ok(Value::Bool(true)),
            Marker::False => Ok(Value::Bool(false)),
            Marker::FixPos(number) => Ok(Value::Int(number as i64)),
            Marker::FixNeg(number) => Ok(Value::Int(number as i64)),
            Marker::U8 => Ok(Value::Int(self.byte("u8")? as i64)),
            Marker::U16 => Ok(Value::Int(self.read_u16()? as i64)),
            Marker::U32 => Ok(Value::Int(self.read_u32()? as i64)),
            Marker::U64 => Ok(Value::from_u64(self.read_u64()?)),
            Marker::I8 => Ok(Value::Int(self.byte("i8")? as i8 as i64)),
            Marker::I16 => Ok(Value::Int(self.read_u16()? as i16 as i64)),
            Marker::I32 => Ok(Value::Int(self.read_u32()? as i32 as i64)),
            Marker::I64 => Ok(Value::Int(self.read_u64()? as i64)),
            Marker::F32 => {
                Ok(Value::Float(f32::from_bits(self.read_u32()?) as f64))
            }
            Marker::F64 => Ok(Value::Float(f64::from_bits(self.read_u64()?))),
            Marker::FixStr(len) => self.read_str(len as usize),
            Marker::Str8 => {
                let len = self.byte("str len")? as usize;
                self.read_str(len)
            }
            Marker::Str16 => {
                let len = self.read_u16()? as usize;
                self.read_str(len)
            }
            Marker::Str32 => {
                let len = self.read_u32()? as usize;
                self.read_str(len)
            }
            Marker::Bin8 => {
                let len = self.byte("bin len")? as usize;
                self.read_bin(len)
            }
            Marker::Bin16 => {
                let len = self.read_u16()? as usize;
                self.read_bin(len)
            }
            Marker::Bin32 => {
                let len = self.read_u32()? as usize;
                self.read_bin(len)
            }
            Marker::FixArray(len) => self.read_list(len as usize, depth),
            Marker::Array16 => {
                let len = self.read_u16()? as usize;
                self.read_list(len, depth)
            }
            Marker::Array32 => {
                let len = self.read_u32()? as usize;
                self.read_list(len, depth)
            }
            Marker::FixMap(len) => self.read_map(len as usize, depth),
            Marker::Map16 => {
                let len = self.read_u16()? as usize;
                self.read_map(len, depth)
            }
            Marker::Map32 => {
                let len = self.read_u32()? as usize;
                self.read_map(len, depth)
            }
            other => Err(ProtoError::Decode(format!(
                "unsupported marker {other:?}"
            ))),
        }
    }

    fn read_str(&mut self, len: usize) -> Result<Value, ProtoError> {
        let len = self.checked_len(len)?;
        let raw = self.take(len, "string payload")?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProtoError::Decode("non-utf8 string".to_string()))?;
        Ok(Value::Str(text.to_string()))
    }

    fn read_bin(&mut self, len: usize) -> Result<Value, ProtoError> {
        let len = self.checked_len(len)?;
        Ok(Value::Bytes(self.take(len, "binary payload")?.to_vec()))
    }

    fn read_list(
        &mut self,
        len: usize,
        depth: usize,
    ) -> Result<Value, ProtoError> {
        let mut items = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            items.push(self.read_value(depth + 1)?);
        }
        Ok(Value::List(items))
    }

    fn read_map(
        &mut self,
        len: usize,
        depth: usize,
    ) -> Result<Value, ProtoError> {
        let mut map = ValueMap::new();
        for _ in 0..len {
            let key = match self.read_value(depth + 1)? {
                Value::Str(key) => key,
                other => {
                    return Err(ProtoError::Decode(format!(
                        "map key must be a string, got {other:?}"
                    )));
                }
            };
            map.insert(key, self.read_value(depth + 1)?);
        }
        promote_tagged(map)
    }
}

/// Turns tagged maps back into their typed values; plain maps pass through.
fn promote_tagged(map: ValueMap) -> Result<Value, ProtoError> {
    if map.get(NDARRAY_TAG) == Some(&Value::Bool(true)) {
        let Some(Value::Bytes(blob)) = map.get(NDARRAY_PAYLOAD) else {
            return Err(ProtoError::Decode(
                "ndarray tag without npy payload".to_string(),
            ));
        };
        return Ok(Value::NdArray(decode_npy(blob)?));
    }
    if map.get(MODALITY_TAG) == Some(&Value::Bool(true)) {
        let Some(Value::Str(json)) = map.get(MODALITY_PAYLOAD) else {
            return Err(ProtoError::Decode(
                "modality tag without json payload".to_string(),
            ));
        };
        return Ok(Value::Modality(ModalityConfig::from_json(json)?));
    }
    Ok(Value::Map(map))
}

#[cfg(test)]
mod tests {
    use super::{decode_value, encode_value, DEFAULT_MAX_FRAME_BYTES};
    use crate::value::{ModalityConfig, NdArray, Value};

    fn round_trip(value: Value) -> Value {
        let mut buf = Vec::new();
        encode_value(&mut buf, &value).expect("encode");
        decode_value(&buf, DEFAULT_MAX_FRAME_BYTES).expect("decode")
    }

    #[test]
    fn scalars_round_trip() {
        for value in [
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-1),
            Value::Int(127),
            Value::Int(-32_768),
            Value::Int(i64::MAX),
            Value::Int(i64::MIN),
            Value::UInt(u64::MAX),
            Value::Float(0.25),
            Value::Float(-1.5e300),
            Value::Str("observation".to_string()),
            Value::Str(String::new()),
            Value::Bytes(vec![0, 1, 2, 255]),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn nested_containers_round_trip() {
        let mut robot = Value::map();
        robot.insert("shoulder.pos".to_string(), Value::Float(12.5));
        robot.insert("gripper.pos".to_string(), Value::Int(1));
        let mut payload = Value::map();
        payload.insert("robot".to_string(), Value::Map(robot));
        payload.insert(
            "tags".to_string(),
            Value::List(vec![
                Value::Str("a".to_string()),
                Value::Nil,
                Value::Bool(false),
            ]),
        );
        let value = Value::Map(payload);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn ndarray_round_trips_through_tagged_map() {
        let array = NdArray::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .expect("build array");
        let value = Value::NdArray(array);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn u8_image_array_round_trips() {
        let array =
            NdArray::from_u8(vec![2, 2, 3], vec![9_u8; 12]).expect("build");
        let value = Value::NdArray(array);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn modality_config_round_trips() {
        let value = Value::Modality(ModalityConfig {
            delta_indices: vec![0],
            modality_keys: vec!["state.arm".to_string()],
        });
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn oversized_binary_is_rejected() {
        let mut buf = Vec::new();
        encode_value(&mut buf, &Value::Bytes(vec![0_u8; 1024]))
            .expect("encode");
        let err = decode_value(&buf, 512).expect_err("limit");
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn non_string_map_keys_are_rejected() {
        // fixmap(1) { 1: 2 }
        let raw = [0x81_u8, 0x01, 0x02];
        let err = decode_value(&raw, DEFAULT_MAX_FRAME_BYTES)
            .expect_err("key type");
        assert!(err.to_string().contains("map key"));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut buf = Vec::new();
        encode_value(&mut buf, &Value::Int(1)).expect("encode");
        buf.push(0xc0);
        let err =
            decode_value(&buf, DEFAULT_MAX_FRAME_BYTES).expect_err("trailing");
        assert!(err.to_string().contains("trailing"));
    }
}
