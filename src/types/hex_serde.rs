//! `serde(with = ...)` helpers that store fixed-size byte arrays as lowercase hex strings.

use serde::{de::Error, Deserialize, Deserializer, Serializer};

pub(crate) fn serialize<S: Serializer, const N: usize>(
    bytes: &[u8; N],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

pub(crate) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
    deserializer: D,
) -> Result<[u8; N], D::Error> {
    let string = String::deserialize(deserializer)?;
    let bytes = hex::decode(&string).map_err(D::Error::custom)?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| D::Error::invalid_length(bytes.len(), &"a fixed-size hex string"))
}
