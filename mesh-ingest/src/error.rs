use thiserror::Error;

/// Enumeration of errors that stop ingestion.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("broker unreachable after {attempts} consecutive attempts: {error}")]
    BrokerUnavailable {
        attempts: u32,
        error: rumqttc::ConnectionError,
    },
    #[error("deduplicator is no longer accepting events")]
    DeduplicatorClosed,
}
