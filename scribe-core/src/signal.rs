//! Unix signal names used for child reload and kill configuration.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The subset of signals scribe can deliver to supervised processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Term,
    Usr1,
    Usr2,
    Kill,
}

impl Signal {
    /// Raw signal number for `libc::kill`.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Term => libc::SIGTERM,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Term => "SIGTERM",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
            Signal::Kill => "SIGKILL",
        };
        f.write_str(name)
    }
}

impl FromStr for Signal {
    type Err = String;

    /// Accepts both `SIGHUP` and `HUP` spellings, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "HUP" => Ok(Signal::Hup),
            "INT" => Ok(Signal::Int),
            "QUIT" => Ok(Signal::Quit),
            "TERM" => Ok(Signal::Term),
            "USR1" => Ok(Signal::Usr1),
            "USR2" => Ok(Signal::Usr2),
            "KILL" => Ok(Signal::Kill),
            other => Err(format!(
                "unknown signal '{other}'; expected one of HUP, INT, QUIT, TERM, USR1, USR2, KILL"
            )),
        }
    }
}

impl Serialize for Signal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("SIGHUP", Signal::Hup)]
    #[case("hup", Signal::Hup)]
    #[case("sigterm", Signal::Term)]
    #[case("USR2", Signal::Usr2)]
    fn parses_both_spellings(#[case] input: &str, #[case] expected: Signal) {
        assert_eq!(input.parse::<Signal>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("SIGWINCH".parse::<Signal>().is_err());
    }

    #[test]
    fn raw_numbers_round_trip() {
        assert_eq!(Signal::Term.as_raw(), libc::SIGTERM);
        assert_eq!(Signal::Hup.as_raw(), libc::SIGHUP);
    }

    #[test]
    fn display_uses_full_name() {
        assert_eq!(Signal::Usr1.to_string(), "SIGUSR1");
    }

    #[test]
    fn serde_round_trip() {
        let yaml = serde_yaml::to_string(&Signal::Term).unwrap();
        assert_eq!(yaml.trim(), "SIGTERM");
        let parsed: Signal = serde_yaml::from_str("sighup").unwrap();
        assert_eq!(parsed, Signal::Hup);
    }
}
