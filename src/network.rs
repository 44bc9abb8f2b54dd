use super::errors::{BTCNetError, Result};

/// Represents the network to which a frame belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Mainnet
    /// Default Port 8333
    #[default]
    MainNet,

    /// Testnet
    /// Default Port 18333
    TestNet,

    /// Regtest
    /// Default Port 18444
    RegTest,
}

impl Network {
    /// The 4 byte magic that starts every frame on this network.
    pub fn magic(self) -> [u8; 4] {
        match self {
            Network::MainNet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::TestNet => [0x0b, 0x11, 0x09, 0x07],
            Network::RegTest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Network::MainNet => 8333,
            Network::TestNet => 18333,
            Network::RegTest => 18444,
        }
    }

    pub fn from_magic(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [0xf9, 0xbe, 0xb4, 0xd9] => Ok(Self::MainNet),
            [0x0b, 0x11, 0x09, 0x07] => Ok(Self::TestNet),
            [0xfa, 0xbf, 0xb5, 0xda] => Ok(Self::RegTest),
            _ => Err(BTCNetError::UnknownNetwork),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = BTCNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Self::MainNet),
            "test" | "testnet" => Ok(Self::TestNet),
            "regtest" => Ok(Self::RegTest),
            _ => Err(BTCNetError::UnknownNetwork),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, TestResult};
    use quickcheck_macros::quickcheck;

    impl Arbitrary for Network {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            match u8::arbitrary(g) % 3 {
                0 => Self::MainNet,
                1 => Self::TestNet,
                2 => Self::RegTest,
                _ => unreachable!(),
            }
        }
    }

    #[quickcheck]
    fn test_magic(network: Network) -> TestResult {
        let network2 = Network::from_magic(&network.magic()).unwrap();
        TestResult::from_bool(network == network2)
    }

    #[test]
    fn test_from_magic() {
        assert_eq!(
            Network::from_magic(&[0xf9, 0xbe, 0xb4, 0xd9]).unwrap(),
            Network::MainNet
        );
        assert_eq!(
            Network::from_magic(&[0x0b, 0x11, 0x09, 0x07]).unwrap(),
            Network::TestNet
        );
        assert_eq!(
            Network::from_magic(&[0xfa, 0xbf, 0xb5, 0xda]).unwrap(),
            Network::RegTest
        );
        assert!(Network::from_magic(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn test_from_str() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::MainNet);
        assert_eq!("TestNet".parse::<Network>().unwrap(), Network::TestNet);
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::RegTest);
        assert!("signet".parse::<Network>().is_err());
    }
}
