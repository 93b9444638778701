use crate::error::ProtoError;
use crate::value::{Dtype, NdArray};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
const NPY_VERSION: [u8; 2] = [1, 0];

/// Serializes an array into a self-contained NPY v1.0 blob: magic, version,
/// header dict and the row-major element bytes.
pub fn encode_npy(array: &NdArray) -> Vec<u8> {
    let shape = format_shape(array.shape());
    let header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        array.dtype().descr(),
        shape
    );

    // The header (including the trailing newline) pads the preamble to a
    // 64-byte boundary.
    let preamble = NPY_MAGIC.len() + NPY_VERSION.len() + 2;
    let unpadded = preamble + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = header.len() + padding + 1;

    let mut out =
        Vec::with_capacity(preamble + header_len + array.data().len());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&NPY_VERSION);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend(std::iter::repeat_n(b' ', padding));
    out.push(b'\n');
    out.extend_from_slice(array.data());
    out
}

/// Parses an NPY v1.x blob back into an array. Fortran-ordered payloads and
/// unsupported dtypes are rejected.
pub fn decode_npy(bytes: &[u8]) -> Result<NdArray, ProtoError> {
    if bytes.len() < 10 {
        return Err(ProtoError::Truncated("npy preamble"));
    }
    if &bytes[..6] != NPY_MAGIC {
        return Err(ProtoError::BadArray("missing NPY magic".to_string()));
    }
    if bytes[6] != 1 {
        return Err(ProtoError::BadArray(format!(
            "unsupported NPY version {}.{}",
            bytes[6], bytes[7]
        )));
    }

    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = 10 + header_len;
    if bytes.len() < data_start {
        return Err(ProtoError::Truncated("npy header"));
    }
    let header = std::str::from_utf8(&bytes[10..data_start])
        .map_err(|_| ProtoError::BadArray("non-utf8 npy header".to_string()))?;

    let descr = extract_quoted(header, "descr")?;
    let dtype = Dtype::from_descr(&descr)?;

    if extract_raw(header, "fortran_order")?.starts_with("True") {
        return Err(ProtoError::BadArray(
            "fortran-ordered arrays are not supported".to_string(),
        ));
    }

    let shape = parse_shape(&extract_raw(header, "shape")?)?;
    NdArray::new(dtype, shape, bytes[data_start..].to_vec())
}

fn format_shape(shape: &[usize]) -> String {
    match shape.len() {
        0 => "()".to_string(),
        1 => format!("({},)", shape[0]),
        _ => {
            let joined = shape
                .iter()
                .map(|dim| dim.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("({joined})")
        }
    }
}

/// Returns the quoted value of `'key': '...'` inside the header dict.
fn extract_quoted(header: &str, key: &str) -> Result<String, ProtoError> {
    let raw = extract_raw(header, key)?;
    let trimmed = raw.trim_start();
    let Some(stripped) = trimmed.strip_prefix('\'') else {
        return Err(ProtoError::BadArray(format!(
            "npy header field {key} is not quoted"
        )));
    };
    match stripped.find('\'') {
        Some(end) => Ok(stripped[..end].to_string()),
        None => Err(ProtoError::BadArray(format!(
            "unterminated npy header field {key}"
        ))),
    }
}

/// Returns the raw text following `'key':` up to the end of the header.
fn extract_raw(header: &str, key: &str) -> Result<String, ProtoError> {
    let needle = format!("'{key}':");
    let at = header.find(&needle).ok_or_else(|| {
        ProtoError::BadArray(format!("npy header missing {key}"))
    })?;
    Ok(header[at + needle.len()..].trim_start().to_string())
}

fn parse_shape(raw: &str) -> Result<Vec<usize>, ProtoError> {
    let Some(open) = raw.find('(') else {
        return Err(ProtoError::BadArray("npy shape is not a tuple".to_string()));
    };
    let Some(close) = raw.find(')') else {
        return Err(ProtoError::BadArray("unterminated npy shape".to_string()));
    };
    let inner = &raw[open + 1..close];
    let mut shape = Vec::new();
    for part in inner.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let dim = trimmed.parse::<usize>().map_err(|_| {
            ProtoError::BadArray(format!("invalid npy dimension {trimmed}"))
        })?;
        shape.push(dim);
    }
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::{decode_npy, encode_npy};
    use crate::value::{Dtype, NdArray};

    #[test]
    fn round_trips_f32_matrix() {
        let array = NdArray::from_f32(vec![2, 2], &[1.0, -2.5, 3.25, 0.0])
            .expect("build array");
        let blob = encode_npy(&array);
        let decoded = decode_npy(&blob).expect("decode");
        assert_eq!(decoded, array);
    }

    #[test]
    fn round_trips_u8_image_shape() {
        let array = NdArray::from_u8(vec![4, 3, 3], vec![7_u8; 36])
            .expect("build array");
        let decoded = decode_npy(&encode_npy(&array)).expect("decode");
        assert_eq!(decoded.dtype(), Dtype::U8);
        assert_eq!(decoded.shape(), &[4, 3, 3]);
        assert_eq!(decoded.data(), array.data());
    }

    #[test]
    fn round_trips_vector_shape() {
        let array =
            NdArray::from_f64(vec![3], &[0.5, 1.5, 2.5]).expect("build array");
        let decoded = decode_npy(&encode_npy(&array)).expect("decode");
        assert_eq!(decoded.shape(), &[3]);
        assert_eq!(decoded.to_f64_vec(), vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn header_is_padded_to_alignment() {
        let array = NdArray::from_f32(vec![1], &[1.0]).expect("build array");
        let blob = encode_npy(&array);
        let header_len = u16::from_le_bytes([blob[8], blob[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(blob[10 + header_len - 1], b'\n');
    }

    #[test]
    fn rejects_bad_magic_and_fortran_order() {
        assert!(decode_npy(b"not-an-npy-blob").is_err());

        let array = NdArray::from_f32(vec![1], &[1.0]).expect("build array");
        let mut blob = encode_npy(&array);
        let text = String::from_utf8_lossy(&blob).replace("False", "True ");
        blob = text.into_bytes();
        let err = decode_npy(&blob).expect_err("fortran order");
        assert!(err.to_string().contains("fortran"));
    }
}
