use std::sync::Arc;

use tracing::info;

use kvb_common::KvResult;

use crate::backend::SharedBackend;
use crate::cluster::ClusterBackend;
use crate::config::BackendConfig;
use crate::sentinel::SentinelBackend;
use crate::standalone::StandaloneBackend;

/// Builds the backend `config` asks for: sentinel first, then cluster, else
/// standalone.
///
/// An error here means no usable backend exists; callers should stop rather
/// than retry.
pub async fn select_backend(config: &BackendConfig) -> KvResult<SharedBackend> {
    config.validate()?;

    let backend: SharedBackend = if config.use_sentinel {
        Arc::new(SentinelBackend::connect(config).await?)
    } else if config.use_cluster {
        Arc::new(ClusterBackend::connect(config).await?)
    } else {
        Arc::new(StandaloneBackend::connect(config).await?)
    };

    info!(kind = %backend.kind(), "backend selected");
    Ok(backend)
}
