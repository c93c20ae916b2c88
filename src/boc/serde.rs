use std::borrow::Cow;

use ::serde::de::{Deserialize, Deserializer, Error as _};
use ::serde::ser::{Error as _, Serialize, Serializer};

use super::Boc;
use crate::cell::{Cell, DynCell, HashBytes};

impl Serialize for DynCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let boc = match Boc::encode(self) {
            Ok(boc) => boc,
            Err(e) => return Err(S::Error::custom(e)),
        };
        if serializer.is_human_readable() {
            serializer.serialize_str(&crate::util::encode_base64(boc))
        } else {
            serializer.serialize_bytes(&boc)
        }
    }
}

impl Serialize for Cell {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Cell {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Boc::deserialize(deserializer)
    }
}

impl Boc {
    /// Serializes cell into an encoded BOC (as base64 for human readable serializers).
    ///
    /// Can be used with `#[serde(with = "Boc")]`.
    pub fn serialize<S, T>(cell: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<DynCell> + ?Sized,
    {
        cell.as_ref().serialize(serializer)
    }

    /// Deserializes cell from an encoded BOC (from base64 for human readable deserializers).
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Cell, D::Error>
    where
        D: Deserializer<'de>,
    {
        let is_human_readable = deserializer.is_human_readable();
        let mut boc = ok!(borrow_cow_bytes(deserializer));

        if is_human_readable {
            match crate::util::decode_base64(boc) {
                Ok(bytes) => {
                    boc = Cow::Owned(bytes);
                }
                Err(_) => return Err(D::Error::custom("invalid base64 string")),
            }
        }

        match Boc::decode(boc) {
            Ok(cell) => Ok(cell),
            Err(e) => Err(D::Error::custom(e)),
        }
    }
}

impl Serialize for HashBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.as_slice()))
        } else {
            serializer.serialize_bytes(self.as_slice())
        }
    }
}

impl<'de> Deserialize<'de> for HashBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let is_human_readable = deserializer.is_human_readable();
        let bytes = ok!(borrow_cow_bytes(deserializer));

        let mut result = HashBytes::ZERO;
        if is_human_readable {
            if hex::decode_to_slice(bytes, &mut result.0).is_err() {
                return Err(D::Error::custom("invalid hash"));
            }
        } else {
            match HashBytes::try_from_slice(&bytes) {
                Some(hash) => result = hash,
                None => return Err(D::Error::invalid_length(bytes.len(), &"32 bytes")),
            }
        }
        Ok(result)
    }
}

fn borrow_cow_bytes<'de: 'a, 'a, D>(deserializer: D) -> Result<Cow<'a, [u8]>, D::Error>
where
    D: Deserializer<'de>,
{
    use ::serde::de::Visitor;

    struct CowBytesVisitor;

    impl<'a> Visitor<'a> for CowBytesVisitor {
        type Value = Cow<'a, [u8]>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a byte array")
        }

        fn visit_str<E: ::serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Cow::Owned(v.as_bytes().to_vec()))
        }

        fn visit_borrowed_str<E: ::serde::de::Error>(self, v: &'a str) -> Result<Self::Value, E> {
            Ok(Cow::Borrowed(v.as_bytes()))
        }

        fn visit_string<E: ::serde::de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(Cow::Owned(v.into_bytes()))
        }

        fn visit_bytes<E: ::serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(Cow::Owned(v.to_vec()))
        }

        fn visit_borrowed_bytes<E: ::serde::de::Error>(
            self,
            v: &'a [u8],
        ) -> Result<Self::Value, E> {
            Ok(Cow::Borrowed(v))
        }

        fn visit_byte_buf<E: ::serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(Cow::Owned(v))
        }
    }

    deserializer.deserialize_bytes(CowBytesVisitor)
}
