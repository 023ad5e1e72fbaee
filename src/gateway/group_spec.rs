use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// The multicast group to receive, optionally restricted to a single source. An unspecified
///  source (0.0.0.0) means any-source multicast (ASM), otherwise source-specific (SSM).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct GroupSpec {
    pub group: Ipv4Addr,
    pub source: Ipv4Addr,
}

impl GroupSpec {
    pub fn asm(group: Ipv4Addr) -> GroupSpec {
        GroupSpec {
            group,
            source: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn ssm(group: Ipv4Addr, source: Ipv4Addr) -> GroupSpec {
        GroupSpec { group, source }
    }

    pub fn is_ssm(&self) -> bool {
        !self.source.is_unspecified()
    }
}

impl Display for GroupSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_ssm() {
            write!(f, "({}, {})", self.source, self.group)
        }
        else {
            write!(f, "(*, {})", self.group)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asm_ssm() {
        let group = Ipv4Addr::new(239, 1, 1, 1);

        let asm = GroupSpec::asm(group);
        assert!(!asm.is_ssm());
        assert_eq!(asm.to_string(), "(*, 239.1.1.1)");

        let ssm = GroupSpec::ssm(group, Ipv4Addr::new(10, 0, 0, 5));
        assert!(ssm.is_ssm());
        assert_eq!(ssm.to_string(), "(10.0.0.5, 239.1.1.1)");

        assert_eq!(GroupSpec::ssm(group, Ipv4Addr::UNSPECIFIED), asm);
    }
}
