use std::{fmt, str::FromStr};

/// A Safe master copy version, e.g. "1.3.0". Only the numeric triple
/// matters; suffixes like "+L2" are ignored for ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SafeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

pub const V1_0_0: SafeVersion = SafeVersion {
    major: 1,
    minor: 0,
    patch: 0,
};
pub const V1_3_0: SafeVersion = SafeVersion {
    major: 1,
    minor: 3,
    patch: 0,
};

#[derive(Debug, thiserror::Error)]
#[error("invalid safe version: {0}")]
pub struct InvalidVersion(String);

impl SafeVersion {
    /// Versions before 1.3.0 hash their EIP-712 domain without a chain id.
    pub fn domain_includes_chain_id(&self) -> bool {
        *self >= V1_3_0
    }

    /// Versions before 1.0.0 used `dataGas` instead of `baseGas` in the
    /// SafeTx type string, which changes the type hash.
    pub fn uses_base_gas(&self) -> bool {
        *self >= V1_0_0
    }
}

impl FromStr for SafeVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numeric = s
            .split_once('+')
            .map(|(version, _suffix)| version)
            .unwrap_or(s);
        let mut parts = numeric.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|part| part.parse().ok())
                .ok_or_else(|| InvalidVersion(s.to_string()))
        };
        let version = Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(InvalidVersion(s.to_string()));
        }
        Ok(version)
    }
}

impl fmt::Display for SafeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_orders() {
        let v111: SafeVersion = "1.1.1".parse().unwrap();
        let v130: SafeVersion = "1.3.0".parse().unwrap();
        let v141: SafeVersion = "1.4.1".parse().unwrap();
        let v092: SafeVersion = "0.9.2".parse().unwrap();
        assert!(v092 < v111 && v111 < v130 && v130 < v141);

        assert!(!v111.domain_includes_chain_id());
        assert!(v130.domain_includes_chain_id());
        assert!(v141.domain_includes_chain_id());
        assert!(!v092.uses_base_gas());
        assert!(v111.uses_base_gas());
    }

    #[test]
    fn parses_l2_suffix() {
        let version: SafeVersion = "1.3.0+L2".parse().unwrap();
        assert_eq!(version, V1_3_0);
        assert_eq!(version.to_string(), "1.3.0");
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "1", "1.2", "1.2.x", "1.2.3.4"] {
            assert!(bad.parse::<SafeVersion>().is_err(), "{bad}");
        }
    }
}
