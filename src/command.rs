use super::errors::{BTCNetError, Result};

/// Size of the zero-padded command field in a frame header.
pub const COMMAND_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    VerAck,
    Ping,
    Pong,
    Addr,
    Inv,
    GetData,
    GetAddr,
    Tx,
    Block,
    /// A command this crate does not understand, kept verbatim.
    Unknown(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Version => "version",
            Command::VerAck => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::GetAddr => "getaddr",
            Command::Tx => "tx",
            Command::Block => "block",
            Command::Unknown(name) => name,
        }
    }

    /// Maps a command name to a command, case-insensitively.
    pub fn from_name(name: &str) -> Self {
        const KNOWN: [Command; 10] = [
            Command::Version,
            Command::VerAck,
            Command::Ping,
            Command::Pong,
            Command::Addr,
            Command::Inv,
            Command::GetData,
            Command::GetAddr,
            Command::Tx,
            Command::Block,
        ];

        KNOWN
            .into_iter()
            .find(|command| command.name().eq_ignore_ascii_case(name))
            .unwrap_or_else(|| Command::Unknown(name.to_string()))
    }

    /// The zero-padded 12 byte header field.
    pub fn to_bytes(&self) -> Result<[u8; COMMAND_SIZE]> {
        let name = self.name();
        if name.len() > COMMAND_SIZE || !name.is_ascii() {
            return Err(BTCNetError::InvalidCommand(name.to_string()));
        }

        let mut bytes = [0u8; COMMAND_SIZE];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let command = String::from_utf8(bytes.to_vec())?;
        Ok(Self::from_name(command.trim_end_matches('\0')))
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, TestResult};
    use quickcheck_macros::quickcheck;

    impl Arbitrary for Command {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            match u8::arbitrary(g) % 11 {
                0 => Self::Version,
                1 => Self::VerAck,
                2 => Self::Ping,
                3 => Self::Pong,
                4 => Self::Addr,
                5 => Self::Inv,
                6 => Self::GetData,
                7 => Self::GetAddr,
                8 => Self::Tx,
                9 => Self::Block,
                10 => Self::Unknown("alert".to_string()),
                _ => unreachable!(),
            }
        }
    }

    #[quickcheck]
    fn test_to_bytes(command: Command) -> TestResult {
        let bytes = command.to_bytes().unwrap();
        let command2 = Command::from_bytes(&bytes).unwrap();
        TestResult::from_bool(command == command2)
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(
            Command::from_bytes("version".as_bytes()).unwrap(),
            Command::Version
        );
        assert_eq!(
            Command::from_bytes("verack\0\0\0\0\0\0".as_bytes()).unwrap(),
            Command::VerAck
        );
        assert_eq!(
            Command::from_bytes("getaddr\0\0\0\0\0".as_bytes()).unwrap(),
            Command::GetAddr
        );
        assert_eq!(
            Command::from_bytes("INV\0\0\0\0\0\0\0\0\0".as_bytes()).unwrap(),
            Command::Inv
        );
        assert_eq!(
            Command::from_bytes("checkorder\0\0".as_bytes()).unwrap(),
            Command::Unknown("checkorder".to_string())
        );
    }

    #[test]
    fn test_padding() {
        let bytes = Command::Tx.to_bytes().unwrap();
        assert_eq!(&bytes, b"tx\0\0\0\0\0\0\0\0\0\0");
    }

    #[test]
    fn test_invalid_command() {
        assert!(Command::Unknown("thirteen-char".to_string()).to_bytes().is_err());
        assert!(Command::from_bytes(&[0xff, 0xfe, 0, 0]).is_err());
    }
}
