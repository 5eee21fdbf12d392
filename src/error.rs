use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// All instances in the pool are unhealthy, or the pool is empty.
    NoHealthyInstances(String),
    /// The service's circuit breaker is open and the reset timeout has not
    /// elapsed; no network attempt was made.
    CircuitOpen(String),
    /// The downstream call itself failed (connect error, protocol error).
    DownstreamFailure(String),
    /// The downstream call exceeded its deadline.
    DownstreamTimeout,
    /// Malformed management request (missing fields, unknown action).
    InvalidManagement(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoHealthyInstances(service) => {
                write!(f, "no healthy instances for service '{}'", service)
            }
            GatewayError::CircuitOpen(service) => {
                write!(f, "circuit breaker open for service '{}'", service)
            }
            GatewayError::DownstreamFailure(msg) => write!(f, "downstream failure: {}", msg),
            GatewayError::DownstreamTimeout => write!(f, "downstream timeout"),
            GatewayError::InvalidManagement(msg) => {
                write!(f, "invalid management request: {}", msg)
            }
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_healthy_instances() {
        assert_eq!(
            GatewayError::NoHealthyInstances("analytics".to_string()).to_string(),
            "no healthy instances for service 'analytics'"
        );
    }

    #[test]
    fn display_circuit_open() {
        assert_eq!(
            GatewayError::CircuitOpen("gamification".to_string()).to_string(),
            "circuit breaker open for service 'gamification'"
        );
    }

    #[test]
    fn display_downstream_failure() {
        assert_eq!(
            GatewayError::DownstreamFailure("conn refused".to_string()).to_string(),
            "downstream failure: conn refused"
        );
    }

    #[test]
    fn display_downstream_timeout() {
        assert_eq!(
            GatewayError::DownstreamTimeout.to_string(),
            "downstream timeout"
        );
    }

    #[test]
    fn display_invalid_management() {
        assert_eq!(
            GatewayError::InvalidManagement("missing 'url'".to_string()).to_string(),
            "invalid management request: missing 'url'"
        );
    }

    #[test]
    fn display_config() {
        assert_eq!(
            GatewayError::Config("bad toml".to_string()).to_string(),
            "config error: bad toml"
        );
    }

    #[test]
    fn display_internal() {
        assert_eq!(
            GatewayError::Internal("oops".to_string()).to_string(),
            "internal error: oops"
        );
    }
}
