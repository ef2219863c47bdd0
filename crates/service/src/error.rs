/// Service-level error taxonomy (protocol/policy/configuration kinds from
/// the design's error handling section; transient I/O and parse errors are
/// handled one layer down, in `codec`, and simply counted here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A control packet referenced a request/segment state that no longer
    /// exists, or arrived with a superseded dateTime.
    Protocol,
    /// A capacity limit was hit: member table full, aggregation queue
    /// over depth, payload over the segment cap.
    Policy,
    /// Invalid configuration supplied by the caller (bad local port,
    /// secret written before persistence loaded, etc). The in-memory
    /// state is left untouched.
    Configuration,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
