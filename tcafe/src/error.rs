use snafu::Snafu;
use tcafe_ingest_core::ProxyError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("failed to load proxy pool"))]
    Proxy { source: ProxyError },
    #[snafu(display("ct ingester failed"))]
    Ct { source: tcafe_ct::IngestError },
    #[snafu(display("rekor ingester failed"))]
    Rekor { source: tcafe_rekor::IngestError },
}

pub type Result<T, E = CliError> = std::result::Result<T, E>;
