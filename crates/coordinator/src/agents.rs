use std::collections::HashMap;
use std::time::Duration;

use tonic::transport::Channel;
use tricorder_proto::agent_client::AgentClient;
use tricorder_proto::{CaptureInfo, CaptureSignal, GoodByeSignal, ResultsRequest};

use crate::error::CoordinatorError;

/// One connected agent: its stable index (matching configuration order, used
/// as the rolling store's `agent_<index>` column), its address for logging,
/// and the results map from its last `GetResults` call.
pub struct AgentInfo {
    pub index: usize,
    pub address: String,
    client: AgentClient<Channel>,
    pub results: HashMap<String, CaptureInfo>,
}

impl AgentInfo {
    async fn connect(index: usize, address: String, timeout: Duration) -> Result<Self, CoordinatorError> {
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{address}"))
            .map_err(|source| CoordinatorError::Connect { address: address.clone(), source })?
            .timeout(timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|source| CoordinatorError::Connect { address: address.clone(), source })?;
        Ok(AgentInfo { index, address, client: AgentClient::new(channel), results: HashMap::new() })
    }

    async fn start_capture(&mut self) -> Result<(), CoordinatorError> {
        self.client
            .start_capture(CaptureSignal {})
            .await
            .map_err(|source| CoordinatorError::Rpc { address: self.address.clone(), source: Box::new(source) })?;
        Ok(())
    }

    async fn get_results(&mut self) -> Result<(), CoordinatorError> {
        let response = self
            .client
            .get_results(ResultsRequest {})
            .await
            .map_err(|source| CoordinatorError::Rpc { address: self.address.clone(), source: Box::new(source) })?;
        self.results = response.into_inner().capture_map;
        Ok(())
    }

    async fn goodbye(&mut self) -> Result<(), CoordinatorError> {
        self.client
            .goodbye(GoodByeSignal {})
            .await
            .map_err(|source| CoordinatorError::Rpc { address: self.address.clone(), source: Box::new(source) })?;
        Ok(())
    }
}

/// Connects to every configured agent, in configuration order, assigning
/// each a stable index 0..N-1. Connection failure is fatal (§4.5 CONNECT).
pub async fn connect_all(addresses: &[String], timeout: Duration) -> Result<Vec<AgentInfo>, CoordinatorError> {
    let mut agents = Vec::with_capacity(addresses.len());
    for (index, address) in addresses.iter().enumerate() {
        let agent = AgentInfo::connect(index, address.clone(), timeout).await?;
        tracing::info!(address = %agent.address, index, "connected to agent");
        agents.push(agent);
    }
    Ok(agents)
}

/// Fans `StartCapture` out to every agent in parallel and waits for all to
/// finish. Any failure is surfaced to the caller, who treats it as fatal.
pub async fn start_capture_all(agents: &mut [AgentInfo]) -> Result<(), CoordinatorError> {
    let futures = agents.iter_mut().map(|agent| agent.start_capture());
    futures::future::try_join_all(futures).await?;
    Ok(())
}

/// Fans `GetResults` out to every agent in parallel, storing each agent's
/// response map on it directly.
pub async fn get_results_all(agents: &mut [AgentInfo]) -> Result<(), CoordinatorError> {
    let futures = agents.iter_mut().map(|agent| agent.get_results());
    futures::future::try_join_all(futures).await?;
    for agent in agents.iter() {
        tracing::info!(address = %agent.address, count = agent.results.len(), "got capture results");
    }
    Ok(())
}

/// Fans `Goodbye` out to every agent in parallel, best-effort: called during
/// shutdown, so a failure here is logged but not propagated.
pub async fn goodbye_all(agents: &mut [AgentInfo]) {
    let futures = agents.iter_mut().map(|agent| async move {
        if let Err(err) = agent.goodbye().await {
            tracing::error!(address = %agent.address, %err, "failed to say goodbye");
        }
    });
    futures::future::join_all(futures).await;
}

#[cfg(test)]
impl AgentInfo {
    /// Builds an `AgentInfo` with the given index and results, backed by a
    /// lazily-connecting channel that is never actually dialed. Used by
    /// store merge tests, which only ever read `.results`.
    pub(crate) fn stub(index: usize, results: HashMap<String, CaptureInfo>) -> Self {
        let channel = Channel::from_static("http://127.0.0.1:0").connect_lazy();
        AgentInfo { index, address: format!("agent-{index}"), client: AgentClient::new(channel), results }
    }
}
