use std::io::{Read, Write};

use super::errors::Result;

pub trait Encodable {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()>;
}

pub trait Decodable {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self>
    where
        Self: Sized;
}

pub fn serialize<T: Encodable + ?Sized>(object: &T) -> Result<Vec<u8>> {
    let mut buffer = vec![];
    object.encode(&mut buffer)?;
    Ok(buffer)
}

/// Decodes a `T` from the front of `bytes`. Trailing bytes are ignored, the
/// way newer protocol fields appended to a payload are ignored by older peers.
pub fn deserialize<T: Decodable>(mut bytes: &[u8]) -> Result<T> {
    T::decode(&mut bytes)
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        use super::wire::WriteWireExt;

        writer.write_var_int(self.len() as u64)?;
        self.iter().try_for_each(|item| item.encode(writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ReadWireExt, WriteWireExt};

    #[derive(Debug, PartialEq)]
    struct Test {
        value: u32,
    }

    impl Encodable for Test {
        fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
            writer.write_u32_le(self.value)
        }
    }

    impl Decodable for Test {
        fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
            Ok(Self {
                value: reader.read_u32_le()?,
            })
        }
    }

    #[test]
    fn test_serialize_deserialize() {
        let test = Test { value: 256 };
        let bytes = serialize(&test).unwrap();
        assert_eq!(bytes, vec![0, 1, 0, 0]);

        let decoded = deserialize::<Test>(&bytes).unwrap();
        assert_eq!(decoded, test);
    }

    #[test]
    fn test_deserialize_ignores_trailing_bytes() {
        let decoded = deserialize::<Test>(&[1, 0, 0, 0, 0xff]).unwrap();
        assert_eq!(decoded.value, 1);
    }

    #[test]
    fn test_vec_is_count_prefixed() {
        let items = vec![Test { value: 1 }, Test { value: 2 }];
        let bytes = serialize(&items).unwrap();
        assert_eq!(bytes.len(), 1 + 8);
        assert_eq!(bytes[0], 2);
    }
}
