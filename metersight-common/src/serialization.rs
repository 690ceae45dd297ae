use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::Result;

/// Payload encoding for bus messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Cbor,
}

pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    Ok(match format {
        Format::Json => serde_json::to_vec(value)?,
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            buf
        }
    })
}

pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    Ok(match format {
        Format::Json => serde_json::from_slice(data)?,
        Format::Cbor => ciborium::from_reader(data)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        value: f64,
        unit: String,
        raw_registers: Vec<u16>,
    }

    fn sample() -> Record {
        Record {
            value: 1.5,
            unit: "W".to_string(),
            raw_registers: vec![0x0000, 0x05DC],
        }
    }

    #[test]
    fn test_json_payload_is_readable() {
        let encoded = encode(&sample(), Format::Json).unwrap();
        let text = String::from_utf8(encoded).unwrap();

        assert!(text.contains("\"unit\":\"W\""));
        assert!(text.contains("\"raw_registers\":[0,1500]"));
    }

    #[test]
    fn test_cbor_is_smaller() {
        let json = encode(&sample(), Format::Json).unwrap();
        let cbor = encode(&sample(), Format::Cbor).unwrap();
        assert!(cbor.len() < json.len());
    }

    #[test]
    fn test_cbor_garbage_rejected() {
        let result: Result<Record> = decode(&[0xff, 0x00, 0x13], Format::Cbor);
        assert!(matches!(result, Err(crate::Error::Cbor(_))));
    }

    #[test]
    fn test_format_names() {
        assert_eq!(serde_json::to_string(&Format::Cbor).unwrap(), "\"cbor\"");
        let format: Format = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, Format::Json);
    }
}
