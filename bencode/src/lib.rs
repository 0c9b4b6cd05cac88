#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod encode;
mod decode;
mod error;
mod token;

pub use encode::{encode_to_raw, encode_to_string};
pub use decode::{decode_bytes, decode_str};
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Nested {
        name: String,
        values: Vec<i64>,
    }

    #[test]
    fn round_trip_via_raw_bytes() {
        let original = Nested { name: "piece".into(), values: vec![1, 2, 3] };
        let raw = encode_to_raw(&original).unwrap();
        let decoded: Nested = decode_bytes(&raw).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn round_trip_via_string() {
        let original = Nested { name: "block".into(), values: vec![-1, 0, 16384] };
        let s = encode_to_string(&original).unwrap();
        let decoded: Nested = decode_str(&s).unwrap();
        assert_eq!(original, decoded);
    }
}
