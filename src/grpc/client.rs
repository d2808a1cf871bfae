use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::{ClusrunError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Dial `host` (`HOST:PORT`) over plaintext HTTP/2.
pub async fn connect(host: &str) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{}", host))
        .map_err(|e| ClusrunError::InvalidHost(host.to_string(), e.to_string()))?
        .connect_timeout(CONNECT_TIMEOUT);
    Ok(endpoint.connect().await?)
}
