use nix::sys::signal::Signal;
use std::str::FromStr;

/// A signal name or number that does not name a known signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSignal(pub String);

impl std::fmt::Display for UnknownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown signal: {:?}", self.0)
    }
}

impl std::error::Error for UnknownSignal {}

/// Parse `SIGUSR1`, `USR1`, `usr1` or a decimal signal number.
pub fn parse_signal(text: &str) -> Result<Signal, UnknownSignal> {
    let trimmed = text.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| UnknownSignal(text.to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| UnknownSignal(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_forms() {
        assert_eq!(parse_signal("SIGUSR1").unwrap(), Signal::SIGUSR1);
        assert_eq!(parse_signal("USR2").unwrap(), Signal::SIGUSR2);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal(" sighup ").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_parse_unknown() {
        let err = parse_signal("SIGBOGUS").unwrap_err();
        assert_eq!(err, UnknownSignal("SIGBOGUS".to_string()));
        assert!(err.to_string().contains("SIGBOGUS"));
        assert!(parse_signal("0").is_err());
        assert!(parse_signal("").is_err());
    }
}
