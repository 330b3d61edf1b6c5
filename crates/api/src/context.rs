use conductor_core::CorrelationId;

/// Header carrying the caller's correlation id, echoed on every response.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Correlation id for a request.
///
/// Taken from [`CORRELATION_HEADER`] when the caller sent a usable one,
/// generated otherwise. Present on every request that went through
/// [`correlation_middleware`](crate::middleware::correlation_middleware).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCorrelation {
    id: CorrelationId,
    from_caller: bool,
}

impl RequestCorrelation {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(CorrelationId::new) {
            Some(Ok(id)) => Self {
                id,
                from_caller: true,
            },
            _ => Self {
                id: CorrelationId::generate(),
                from_caller: false,
            },
        }
    }

    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Whether the id came from the request rather than being generated.
    pub fn from_caller(&self) -> bool {
        self.from_caller
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_is_used() {
        let c = RequestCorrelation::from_header(Some("req-7"));
        assert_eq!(c.id().as_str(), "req-7");
        assert!(c.from_caller());
    }

    #[test]
    fn missing_or_blank_header_generates() {
        assert!(!RequestCorrelation::from_header(None).from_caller());
        let blank = RequestCorrelation::from_header(Some("   "));
        assert!(!blank.from_caller());
        assert!(!blank.id().as_str().trim().is_empty());
    }
}
