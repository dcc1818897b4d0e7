/// Base64 helpers, including serde (de)serializers for fixed-size byte arrays, in the
/// shape `flux::session::server::SessionKey` uses them in the teacher.
pub mod base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserializer, Serializer};

    pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
        STANDARD.encode(data)
    }

    pub fn decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(data)
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <&str>::deserialize(deserializer)?;
        decode(s).map_err(de::Error::custom)
    }
}

/// Lowercase-hex helpers used throughout the wire codec and the signing routines.
pub mod hexstr {
    pub fn encode(data: &[u8]) -> String {
        hex::encode(data)
    }

    pub fn decode(data: &str) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(data)
    }
}
